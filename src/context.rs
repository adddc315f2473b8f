use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::dom::shorten;
use crate::error::{HarnessError, Result};
use crate::replay::{BrowserAction, ReplayEvent, Speaker};
use crate::retrieval::SimilarityScorer;
use crate::types::{CANDIDATE_DOC_MAX_CHARS, ElementRecord, NUM_PREV_TURNS, NUM_UTTERANCES, UID_ATTRIBUTE};

const SYSTEM_PROMPT: &str = "You are an AI assistant with a deep understanding of HTML \
and you must predict actions based on a user request, which will be executed. Use one of \
the following, replacing [] with an appropriate value: change(value=[str], uid=[str]) ; \
click(uid=[str]) ; load(url=[str]) ; say(speaker=\"navigator\", utterance=[str]) ; \
scroll(x=[int], y=[int]) ; submit(uid=[str]) ; text_input(text=[str], uid=[str]) ;";

const INSTRUCTION: &str = "Please select the best action using the correct format, \
do not provide any other information or explanation.";

/// Read-only view of the session that one model query is built from.
#[derive(Debug, Clone)]
pub struct TurnContext<'a> {
    pub demo_name: &'a str,
    /// Replay index of the slot this query will fill.
    pub turn_index: usize,
    pub events: &'a [ReplayEvent],
    /// Interactive elements of the page the next action starts from.
    pub elements: &'a [ElementRecord],
    /// Page file of the prior state; `None` before the first page load.
    pub prior_state: Option<&'a str>,
    pub current_url: Option<&'a str>,
    pub viewport: (u32, u32),
    pub num_candidates: usize,
    pub max_prompt_chars: usize,
}

/// One (query, element) pair sent to the retrieval model.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub demo_name: String,
    pub turn_index: usize,
    pub uid: String,
    pub query: String,
    pub doc: String,
    pub score: Option<f64>,
    pub rank: Option<usize>,
}

pub type GroupKey = (String, usize);

/// A candidate that made the cut.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub uid: String,
    pub doc: String,
    pub rank: usize,
}

/// Builds the full prompt for the current turn, consulting the retrieval
/// model unless no page has been loaded yet.
pub async fn build_prompt<S: SimilarityScorer>(scorer: &S, ctx: &TurnContext<'_>) -> Result<String> {
    if ctx.prior_state.is_none() {
        debug!(turn_index = ctx.turn_index, "no page state, skipping retrieval");
        return Ok(render_prompt(ctx, None));
    }
    if ctx.elements.is_empty() {
        debug!(turn_index = ctx.turn_index, "page has no interactive elements");
        return Ok(render_prompt(ctx, Some(&[][..])));
    }

    let mut groups = group_records(build_records(ctx));
    verify_queries(&groups)?;

    for group in groups.values_mut() {
        let query = group[0].query.clone();
        let docs: Vec<String> = group.iter().map(|r| r.doc.clone()).collect();
        let scores = scorer.score(&query, &docs).await?;
        let ranks = ranks_from_scores(&scores);
        for ((record, score), rank) in group.iter_mut().zip(scores).zip(ranks) {
            record.score = Some(score);
            record.rank = Some(rank);
        }
    }

    let key = (ctx.demo_name.to_string(), ctx.turn_index);
    let selected = groups
        .get(&key)
        .map(|g| select_candidates(g, ctx.num_candidates))
        .unwrap_or_default();
    info!(
        turn_index = ctx.turn_index,
        pool = ctx.elements.len(),
        selected = selected.len(),
        "candidates ranked"
    );

    Ok(render_prompt(ctx, Some(&selected)))
}

/// One record per known interactive element, all sharing the turn's query.
pub fn build_records(ctx: &TurnContext<'_>) -> Vec<CandidateRecord> {
    let query = build_query(ctx);
    ctx.elements
        .iter()
        .map(|el| CandidateRecord {
            demo_name: ctx.demo_name.to_string(),
            turn_index: ctx.turn_index,
            uid: el.uid.clone(),
            query: query.clone(),
            doc: format_doc(el),
            score: None,
            rank: None,
        })
        .collect()
}

pub fn group_records(records: Vec<CandidateRecord>) -> BTreeMap<GroupKey, Vec<CandidateRecord>> {
    let mut groups: BTreeMap<GroupKey, Vec<CandidateRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.demo_name.clone(), record.turn_index))
            .or_default()
            .push(record);
    }
    groups
}

/// Every record of a group must carry the same query.
pub fn verify_queries(groups: &BTreeMap<GroupKey, Vec<CandidateRecord>>) -> Result<()> {
    for ((demo, turn), group) in groups {
        let Some(first) = group.first() else { continue };
        if let Some(other) = group.iter().find(|r| r.query != first.query) {
            return Err(HarnessError::InconsistentQuery {
                group: format!("{demo}/{turn}"),
                first: first.query.clone(),
                other: other.query.clone(),
            });
        }
    }
    Ok(())
}

/// Rank of each score, 1 for the highest. Equal scores keep input order;
/// NaN sorts last.
pub fn ranks_from_scores(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| match (scores[a].is_nan(), scores[b].is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal),
    });

    let mut ranks = vec![0; scores.len()];
    for (position, index) in order.into_iter().enumerate() {
        ranks[index] = position + 1;
    }
    ranks
}

/// Best `k` ranked records, one per uid.
pub fn select_candidates(group: &[CandidateRecord], k: usize) -> Vec<RankedCandidate> {
    let mut ranked: Vec<&CandidateRecord> = group.iter().filter(|r| r.rank.is_some()).collect();
    ranked.sort_by_key(|r| r.rank);

    let mut seen = HashSet::new();
    ranked
        .into_iter()
        .filter(|r| seen.insert(r.uid.as_str()))
        .take(k)
        .map(|r| RankedCandidate {
            uid: r.uid.clone(),
            doc: r.doc.clone(),
            rank: r.rank.unwrap_or_default(),
        })
        .collect()
}

pub fn build_query(ctx: &TurnContext<'_>) -> String {
    let mut parts = vec![format_utterances(ctx)];
    parts.push(format!(
        "Viewport(height={}, width={})",
        ctx.viewport.1, ctx.viewport.0
    ));
    parts.extend(previous_turns(ctx));
    parts.join(" ; ")
}

fn format_doc(el: &ElementRecord) -> String {
    let attributes: Vec<String> = el
        .attributes
        .iter()
        .filter(|(k, _)| k.as_str() != UID_ATTRIBUTE)
        .map(|(k, v)| format!("{k}='{v}'"))
        .collect();
    format!(
        "[[tag]] {} [[text]] {} [[bbox]] x={} y={} width={} height={} [[attributes]] {}",
        el.tag,
        el.text,
        el.bbox.x.round(),
        el.bbox.y.round(),
        el.bbox.width.round(),
        el.bbox.height.round(),
        attributes.join(" ")
    )
}

/// First instructor utterance plus the most recent ones, each with its
/// session time.
fn format_utterances(ctx: &TurnContext<'_>) -> String {
    let said: Vec<(u64, &str)> = history(ctx)
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Chat {
                timestamp,
                speaker: Speaker::Instructor,
                utterance,
            } => Some((*timestamp, utterance.as_str())),
            _ => None,
        })
        .collect();

    if said.is_empty() {
        return "No instructor utterance".to_string();
    }
    let selected: Vec<(u64, &str)> = if said.len() <= NUM_UTTERANCES {
        said
    } else {
        let mut s = vec![said[0]];
        s.extend_from_slice(&said[said.len() - (NUM_UTTERANCES - 1)..]);
        s
    };

    selected
        .iter()
        .map(|(t, u)| format!("[{}:{:02}] {}", t / 60, t % 60, u.trim()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last few committed turns before the current one, oldest first.
fn previous_turns(ctx: &TurnContext<'_>) -> Vec<String> {
    let committed: Vec<&ReplayEvent> = history(ctx).iter().filter(|e| !e.is_pending()).collect();
    let start = committed.len().saturating_sub(NUM_PREV_TURNS);
    committed[start..].iter().map(|e| format_turn(e)).collect()
}

fn history<'a>(ctx: &TurnContext<'a>) -> &'a [ReplayEvent] {
    let events: &'a [ReplayEvent] = ctx.events;
    &events[..ctx.turn_index.min(events.len())]
}

/// `[speaker] -> SAY: text` for chat, `[tag] -> INTENT: arg` for actions.
fn format_turn(event: &ReplayEvent) -> String {
    match event {
        ReplayEvent::Chat {
            speaker, utterance, ..
        } => {
            let who = match speaker {
                Speaker::Instructor => "instructor",
                Speaker::Navigator => "navigator",
            };
            format!("[{who}] -> SAY: {}", utterance.trim())
        }
        ReplayEvent::Browser { action, .. } => {
            let mut s = String::new();
            if let Some(el) = action.element() {
                s.push_str(&format!("[{}] ", el.tag_name));
            }
            s.push_str(&format!("-> {}", action.intent().to_uppercase()));
            let data = match action {
                BrowserAction::TextInput { text, .. } => Some(text.clone()),
                BrowserAction::Change { value, .. } => Some(value.clone()),
                BrowserAction::Scroll {
                    scroll_x, scroll_y, ..
                } => Some(format!("x={scroll_x}, y={scroll_y}")),
                BrowserAction::Load { properties, .. } => Some(shorten(&properties.url, 50)),
                BrowserAction::Click { .. } | BrowserAction::Submit { .. } => None,
            };
            if let Some(data) = data {
                s.push_str(&format!(": {data}"));
            }
            s
        }
    }
}

fn format_candidates(candidates: &[RankedCandidate]) -> String {
    candidates
        .iter()
        .map(|c| {
            let doc = c.doc.replace('\n', " ");
            format!("({}) uid = {} {}\n", c.rank, c.uid, shorten(&doc, CANDIDATE_DOC_MAX_CHARS))
        })
        .collect()
}

/// Renders the prompt, trimming it to `max_prompt_chars`: oldest turns go
/// first, then the weakest candidates, then the middle of the utterances.
pub fn render_prompt(ctx: &TurnContext<'_>, candidates: Option<&[RankedCandidate]>) -> String {
    let mut utterances = format_utterances(ctx);
    let mut turns = previous_turns(ctx);
    let mut cands: Vec<RankedCandidate> = candidates.map(<[_]>::to_vec).unwrap_or_default();

    loop {
        let prompt = layout(ctx, &utterances, &turns, candidates.map(|_| cands.as_slice()));
        let len = prompt.chars().count();
        if len <= ctx.max_prompt_chars {
            return prompt;
        }
        if !turns.is_empty() {
            turns.remove(0);
        } else if !cands.is_empty() {
            cands.pop();
        } else {
            let excess = len - ctx.max_prompt_chars;
            let next = truncate_center(&utterances, excess);
            if next == utterances {
                return prompt;
            }
            utterances = next;
        }
    }
}

fn layout(
    ctx: &TurnContext<'_>,
    utterances: &str,
    turns: &[String],
    candidates: Option<&[RankedCandidate]>,
) -> String {
    let (width, height) = ctx.viewport;
    let candidates = match candidates {
        Some(c) if !c.is_empty() => format!("Here are the top candidates for this turn:\n{}", format_candidates(c)),
        Some(_) => "No candidates are available for this turn.\n".to_string(),
        None => "No page has been loaded yet.\n".to_string(),
    };
    let url = ctx.current_url.unwrap_or("about:blank");
    let turns = if turns.is_empty() {
        "None".to_string()
    } else {
        turns.join(" ; ")
    };

    format!(
        "<s>[INST] <<SYS>>\n{SYSTEM_PROMPT}\nThe user's first and last {} utterances are: {utterances} ;\n\
         Viewport size: {height}h x {width}w ;\nOnly the last {NUM_PREV_TURNS} turns are provided.\n<</SYS>>\n\n\
         {candidates}Current page: {url}\nPrevious turns: {turns}\n{INSTRUCTION} [/INST]",
        NUM_UTTERANCES - 1
    )
}

/// Removes at least `excess` characters from the middle of `text`.
fn truncate_center(text: &str, excess: usize) -> String {
    const MARK: &str = " ... ";
    let chars: Vec<char> = text.chars().collect();
    let remove = excess + MARK.len();
    if remove >= chars.len() {
        return String::new();
    }
    let keep = chars.len() - remove;
    let head = keep / 2;
    let tail = keep - head;
    let mut out: String = chars[..head].iter().collect();
    out.push_str(MARK);
    out.extend(&chars[chars.len() - tail..]);
    out
}
