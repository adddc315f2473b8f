use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{info, warn};

use crate::brain::ActionGenerator;
use crate::context;
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::{HarnessError, Result};
use crate::hands::Browser;
use crate::parser::{self, ParsedAction};
use crate::retrieval::SimilarityScorer;
use crate::session::Session;

/// One message typed into the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// Anything other than a control word.
    Instruction(String),
    /// Lets the model act again without new instructions.
    Continue,
    Quit,
}

impl TurnInput {
    pub fn from_chat(message: &str) -> Self {
        let trimmed = message.trim();
        if trimmed.eq_ignore_ascii_case("continue") {
            TurnInput::Continue
        } else if trimmed.eq_ignore_ascii_case("quit") {
            TurnInput::Quit
        } else {
            TurnInput::Instruction(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Acted {
        action: ParsedAction,
        outcome: DispatchOutcome,
    },
    Closed,
}

/// Drives a session one chat message at a time.
pub struct Agent<B: Browser, S: SimilarityScorer, G: ActionGenerator> {
    session: Session<B>,
    scorer: S,
    generator: G,
}

impl<B, S, G> Agent<B, S, G>
where
    B: Browser,
    S: SimilarityScorer,
    G: ActionGenerator,
{
    pub fn new(session: Session<B>, scorer: S, generator: G) -> Self {
        Self {
            session,
            scorer,
            generator,
        }
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    pub async fn handle(&mut self, input: TurnInput) -> Result<TurnOutcome> {
        if !self.session.is_open() {
            return Err(HarnessError::SessionClosed);
        }

        match input {
            TurnInput::Quit => {
                self.session.teardown()?;
                Ok(TurnOutcome::Closed)
            }
            TurnInput::Continue => self.model_turn().await,
            TurnInput::Instruction(text) => {
                self.session.state_mut().record_instruction(&text)?;
                info!(turn_index = self.session.state().turn_index(), "instruction recorded");
                self.model_turn().await
            }
        }
    }

    async fn model_turn(&mut self) -> Result<TurnOutcome> {
        self.session.state_mut().reserve_turn()?;

        match self.act().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, turn_index = self.session.state().turn_index(), "turn abandoned");
                self.session.state_mut().abandon_turn()?;
                Err(e)
            }
        }
    }

    async fn act(&mut self) -> Result<TurnOutcome> {
        let url = self.session.browser()?.current_url().ok();
        let state = self.session.state();
        let prior = state.prior_state();
        let ctx = state.turn_context(prior.as_deref(), url.as_deref());

        let prompt = context::build_prompt(&self.scorer, &ctx).await?;
        let raw = self.generator.generate(&prompt).await?;
        let action = parser::parse(&raw)?;
        info!(intent = action.name(), turn_index = state.turn_index(), "action parsed");

        let session = &mut self.session;
        let outcome = run_blocking(|| dispatcher::dispatch(session, &action))?;
        Ok(TurnOutcome::Acted { action, outcome })
    }
}

/// Runs browser work without stalling other tasks on a multi-threaded
/// runtime. Elsewhere it runs inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{ReplayEvent, Speaker};
    use crate::testing::{StubBrowser, stub_session};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct EvenScores;

    impl SimilarityScorer for EvenScores {
        async fn score(&self, _query: &str, docs: &[String]) -> Result<Vec<f64>> {
            Ok(docs.iter().map(|_| 0.5).collect())
        }
    }

    /// Answers with queued replies; an empty queue is a service failure.
    struct Scripted {
        replies: RefCell<VecDeque<String>>,
        prompts: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: RefCell::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl ActionGenerator for Scripted {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| HarnessError::GenerationService("no reply queued".into()))
        }
    }

    fn agent(dir: &std::path::Path, replies: &[&str]) -> Agent<StubBrowser, EvenScores, Scripted> {
        Agent::new(stub_session(dir), EvenScores, Scripted::new(replies))
    }

    #[test]
    fn chat_messages_map_to_inputs() {
        assert_eq!(TurnInput::from_chat(" Continue "), TurnInput::Continue);
        assert_eq!(TurnInput::from_chat("QUIT"), TurnInput::Quit);
        assert_eq!(
            TurnInput::from_chat("  find the docs "),
            TurnInput::Instruction("find the docs".into())
        );
        assert_eq!(
            TurnInput::from_chat("continue please"),
            TurnInput::Instruction("continue please".into())
        );
    }

    #[tokio::test]
    async fn instruction_reserves_two_slots_and_continue_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(
            tmp.path(),
            &[r#"load(url="https://example.com")"#, r#"say(utterance="Loaded.")"#],
        );

        let outcome = agent
            .handle(TurnInput::Instruction("open example.com".into()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Acted {
                action: ParsedAction::Load { .. },
                ..
            }
        ));
        let state = agent.session().state();
        assert_eq!(state.turn_index(), 1);
        assert_eq!(state.page_index(), 1);

        agent.handle(TurnInput::Continue).await.unwrap();
        let state = agent.session().state();
        assert_eq!(state.turn_index(), 2);
        assert_eq!(state.page_index(), 1);
        assert_eq!(state.replay().len(), 3);
        assert_eq!(state.messages().len(), 3);
    }

    #[tokio::test]
    async fn first_turn_prompt_has_no_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(tmp.path(), &[r#"load(url="https://example.com")"#]);
        agent
            .handle(TurnInput::Instruction("open example.com".into()))
            .await
            .unwrap();

        let prompts = agent.generator.prompts.borrow();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("open example.com"));
        assert!(!prompts[0].contains("uid = "));
    }

    #[tokio::test]
    async fn later_turns_offer_scanned_elements() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(
            tmp.path(),
            &[r#"load(url="https://example.com")"#, r#"say(utterance="ok")"#],
        );
        agent
            .handle(TurnInput::Instruction("open example.com".into()))
            .await
            .unwrap();
        agent.handle(TurnInput::Continue).await.unwrap();

        let prompts = agent.generator.prompts.borrow();
        assert!(prompts[1].contains("Rust language"));
        assert!(prompts[1].contains("https://example.com"));
    }

    #[tokio::test]
    async fn failed_generation_rolls_the_turn_back() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(tmp.path(), &[]);

        let err = agent
            .handle(TurnInput::Instruction("hello".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::GenerationService(_)));

        let state = agent.session().state();
        assert_eq!(state.turn_index(), 0);
        assert_eq!(state.replay().len(), 1);
        assert!(!state.replay().has_pending());
        assert_eq!(state.page_index(), 0);

        let on_disk = std::fs::read_to_string(state.replay().path()).unwrap();
        assert!(!on_disk.contains("pending"));
    }

    #[tokio::test]
    async fn unparsable_reply_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(tmp.path(), &["I am not sure what to do."]);

        let err = agent.handle(TurnInput::Continue).await.unwrap_err();
        assert!(matches!(err, HarnessError::UnparsableAction(_)));
        let state = agent.session().state();
        assert_eq!(state.turn_index(), -1);
        assert!(state.replay().is_empty());
    }

    #[tokio::test]
    async fn quit_logs_farewell_and_refuses_more_input() {
        let tmp = tempfile::tempdir().unwrap();
        let mut agent = agent(tmp.path(), &[]);

        assert_eq!(agent.handle(TurnInput::Quit).await.unwrap(), TurnOutcome::Closed);
        assert!(!agent.session().is_open());
        assert!(matches!(
            agent.session().state().replay().events(),
            [ReplayEvent::Chat {
                speaker: Speaker::Instructor,
                ..
            }]
        ));

        for input in [TurnInput::Continue, TurnInput::Quit] {
            assert!(matches!(
                agent.handle(input).await,
                Err(HarnessError::SessionClosed)
            ));
        }
    }
}
