use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{HarnessError, Result};

/// First `name(...)` in the text. Parentheses inside quoted values do not
/// end the call.
static CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\(((?:[^()"']|"[^"]*"|'[^']*')*)\)"#).expect("call pattern")
});

/// `key="value"`, `key='value'` or `key=bare`, anywhere in the argument list.
static ARGUMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s,)"']+))"#).expect("argument pattern")
});

/// A model action, typed. Raw model text never travels past [`parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedAction {
    Say { utterance: String },
    Load { url: String },
    Click { uid: String },
    TextInput { text: String, uid: String },
    Scroll { x: f64, y: f64 },
    Submit { uid: String },
    Change { value: String, uid: String },
}

impl ParsedAction {
    /// Name of the action in the model's call syntax.
    pub fn name(&self) -> &'static str {
        match self {
            ParsedAction::Say { .. } => "say",
            ParsedAction::Load { .. } => "load",
            ParsedAction::Click { .. } => "click",
            ParsedAction::TextInput { .. } => "text_input",
            ParsedAction::Scroll { .. } => "scroll",
            ParsedAction::Submit { .. } => "submit",
            ParsedAction::Change { .. } => "change",
        }
    }

    /// Whether dispatching this action changes the page.
    pub fn changes_page(&self) -> bool {
        !matches!(self, ParsedAction::Say { .. })
    }
}

impl fmt::Display for ParsedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedAction::Say { utterance } => write!(f, "say(utterance=\"{utterance}\")"),
            ParsedAction::Load { url } => write!(f, "load(url=\"{url}\")"),
            ParsedAction::Click { uid } => write!(f, "click(uid=\"{uid}\")"),
            ParsedAction::TextInput { text, uid } => {
                write!(f, "text_input(text=\"{text}\", uid=\"{uid}\")")
            }
            ParsedAction::Scroll { x, y } => write!(f, "scroll(x=\"{x}\", y=\"{y}\")"),
            ParsedAction::Submit { uid } => write!(f, "submit(uid=\"{uid}\")"),
            ParsedAction::Change { value, uid } => {
                write!(f, "change(value=\"{value}\", uid=\"{uid}\")")
            }
        }
    }
}

/// Pulls the first call out of free-form model output and types it.
pub fn parse(raw: &str) -> Result<ParsedAction> {
    let call = CALL
        .captures(raw)
        .ok_or_else(|| HarnessError::UnparsableAction(raw.trim().to_string()))?;
    let name = call[1].to_lowercase();
    let args = Arguments::read(&name, &call[2]);

    let action = match name.as_str() {
        "say" => ParsedAction::Say {
            utterance: args.get("utterance")?,
        },
        "load" => ParsedAction::Load {
            url: args.get("url")?,
        },
        "click" => ParsedAction::Click {
            uid: args.get("uid")?,
        },
        "text_input" => ParsedAction::TextInput {
            text: args.get("text")?,
            uid: args.get("uid")?,
        },
        "scroll" => ParsedAction::Scroll {
            x: args.number("x")?,
            y: args.number("y")?,
        },
        "submit" => ParsedAction::Submit {
            uid: args.get("uid")?,
        },
        "change" => ParsedAction::Change {
            value: args.get("value")?,
            uid: args.get("uid")?,
        },
        _ => return Err(HarnessError::UnknownIntent(name)),
    };
    Ok(action)
}

struct Arguments<'a> {
    call: &'a str,
    values: HashMap<&'a str, &'a str>,
}

impl<'a> Arguments<'a> {
    fn read(call: &'a str, list: &'a str) -> Self {
        let mut values = HashMap::new();
        for cap in ARGUMENT.captures_iter(list) {
            let (Some(key), Some(value)) = (
                cap.get(1),
                cap.get(2).or_else(|| cap.get(3)).or_else(|| cap.get(4)),
            ) else {
                continue;
            };
            // first occurrence wins
            values.entry(key.as_str()).or_insert(value.as_str());
        }
        Self { call, values }
    }

    fn get(&self, key: &str) -> Result<String> {
        self.values
            .get(key)
            .map(|v| v.to_string())
            .ok_or_else(|| {
                HarnessError::UnparsableAction(format!("{}() is missing argument '{key}'", self.call))
            })
    }

    fn number(&self, key: &str) -> Result<f64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(HarnessError::UnparsableAction(format!(
                "{}() argument '{key}' is not a finite number: {raw:?}",
                self.call
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn say_yields_the_utterance() {
        assert_eq!(
            parse(r#"say(utterance="Hello")"#).unwrap(),
            ParsedAction::Say {
                utterance: "Hello".into()
            }
        );
    }

    #[test]
    fn click_yields_the_uid() {
        assert_eq!(
            parse(r#"click(uid="abc123")"#).unwrap(),
            ParsedAction::Click { uid: "abc123".into() }
        );
    }

    #[test]
    fn text_without_a_call_is_unparsable() {
        assert!(matches!(
            parse("garbage text"),
            Err(HarnessError::UnparsableAction(_))
        ));
    }

    #[test]
    fn unknown_call_name_is_unknown_intent() {
        match parse(r#"foo(x="1")"#) {
            Err(HarnessError::UnknownIntent(name)) => assert_eq!(name, "foo"),
            other => panic!("expected UnknownIntent, got {other:?}"),
        }
    }

    #[test]
    fn surrounding_commentary_is_ignored_and_first_call_wins() {
        let raw = r#"Sure, I'll search. text_input(text="rust book", uid="9f1c") then click(uid="other")"#;
        assert_eq!(
            parse(raw).unwrap(),
            ParsedAction::TextInput {
                text: "rust book".into(),
                uid: "9f1c".into()
            }
        );
    }

    #[test]
    fn argument_order_and_extra_arguments_do_not_matter() {
        assert_eq!(
            parse(r#"say(speaker="navigator", utterance="Done!")"#).unwrap(),
            ParsedAction::Say {
                utterance: "Done!".into()
            }
        );
        assert_eq!(
            parse(r#"change(uid="u2", value="blue")"#).unwrap(),
            ParsedAction::Change {
                value: "blue".into(),
                uid: "u2".into()
            }
        );
    }

    #[test]
    fn text_argument_does_not_shadow_x() {
        // `text="..."` contains the characters `x="` and must not be read as x.
        assert!(matches!(
            parse(r#"scroll(text="1", y="2")"#),
            Err(HarnessError::UnparsableAction(_))
        ));
    }

    #[test]
    fn scroll_accepts_quoted_and_bare_numbers() {
        assert_eq!(
            parse(r#"scroll(x="0", y=400)"#).unwrap(),
            ParsedAction::Scroll { x: 0.0, y: 400.0 }
        );
        assert!(matches!(
            parse(r#"scroll(x="0", y="down")"#),
            Err(HarnessError::UnparsableAction(_))
        ));
    }

    #[test]
    fn scroll_rejects_non_finite_numbers() {
        for raw in [
            r#"scroll(x="NaN", y="0")"#,
            r#"scroll(x="0", y="inf")"#,
            r#"scroll(x=-infinity, y=0)"#,
        ] {
            assert!(
                matches!(parse(raw), Err(HarnessError::UnparsableAction(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn parentheses_inside_quotes_stay_in_the_value() {
        assert_eq!(
            parse(r#"say(utterance="All set :) anything else?")"#).unwrap(),
            ParsedAction::Say {
                utterance: "All set :) anything else?".into()
            }
        );
    }

    #[test]
    fn load_with_single_quotes() {
        assert_eq!(
            parse("load(url='https://example.com/a?b=1')").unwrap(),
            ParsedAction::Load {
                url: "https://example.com/a?b=1".into()
            }
        );
    }

    #[test]
    fn missing_argument_is_unparsable() {
        assert!(matches!(
            parse("submit()"),
            Err(HarnessError::UnparsableAction(_))
        ));
    }

    #[test]
    fn display_renders_call_syntax_that_parses_back() {
        let action = ParsedAction::Scroll { x: 0.0, y: 250.5 };
        assert_eq!(action.to_string(), r#"scroll(x="0", y="250.5")"#);
        assert_eq!(parse(&action.to_string()).unwrap(), action);
    }

    #[test]
    fn only_say_leaves_the_page_alone() {
        assert!(!ParsedAction::Say { utterance: "x".into() }.changes_page());
        assert!(ParsedAction::Scroll { x: 0.0, y: 0.0 }.changes_page());
    }
}
