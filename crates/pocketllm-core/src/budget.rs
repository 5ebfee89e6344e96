use tracing::debug;

use crate::chat_template::{ChatFormat, Turn};
use crate::error::{SessionError, SessionResult};

/// Anything that can estimate the token cost of a piece of text.
pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> SessionResult<usize>;
}

/// A prompt fitted into a token budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetedPrompt {
    pub prompt: String,
    /// Number of trailing turns that made it into the prompt.
    pub included_turns: usize,
    /// Number of leading turns dropped for space.
    pub dropped_turns: usize,
    /// Estimated cost of the system block plus the included turns.
    pub estimated_tokens: usize,
}

/// Token budget left for the prompt once generation room is reserved.
pub fn prompt_budget(context_size: usize, reserved_for_generation: usize) -> usize {
    context_size.saturating_sub(reserved_for_generation)
}

/// Assemble a prompt from the newest turns that fit into `budget` tokens.
///
/// The system block is always included. Turns are costed from newest to
/// oldest and the walk stops at the first turn that would overflow, so the
/// result is always a contiguous suffix of the conversation. The kept turns
/// are rendered in chronological order and followed by an open assistant turn.
///
/// Fails with [`SessionError::LatestTurnTooLong`] when the newest turn does
/// not fit next to the system block.
pub fn build_budgeted_prompt(
    counter: &impl TokenCounter,
    format: ChatFormat,
    system: &str,
    turns: &[Turn],
    budget: usize,
) -> SessionResult<BudgetedPrompt> {
    let system_block = format.render_system(system);
    let mut used = counter.count_tokens(&system_block)?;

    let mut rendered: Vec<String> = Vec::new();
    for turn in turns.iter().rev() {
        let block = format.render_turn(turn);
        let cost = counter.count_tokens(&block)?;
        if used + cost > budget {
            if rendered.is_empty() {
                return Err(SessionError::LatestTurnTooLong {
                    needed: cost,
                    available: budget.saturating_sub(used),
                });
            }
            break;
        }
        used += cost;
        rendered.push(block);
    }

    let included_turns = rendered.len();
    let dropped_turns = turns.len() - included_turns;
    if dropped_turns > 0 {
        debug!(dropped_turns, included_turns, budget, "Dropped oldest turns to fit prompt budget");
    }

    let mut prompt = system_block;
    for block in rendered.iter().rev() {
        prompt.push_str(block);
    }
    prompt.push_str(format.assistant_open());

    Ok(BudgetedPrompt { prompt, included_turns, dropped_turns, estimated_tokens: used })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per whitespace-separated word.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count_tokens(&self, text: &str) -> SessionResult<usize> {
            Ok(text.split_whitespace().count())
        }
    }

    fn conversation() -> Vec<Turn> {
        vec![
            Turn::user("one two three four"),
            Turn::assistant("five six"),
            Turn::user("seven eight nine"),
        ]
    }

    #[test]
    fn everything_fits() {
        let out =
            build_budgeted_prompt(&WordCounter, ChatFormat::Plain, "sys", &conversation(), 100)
                .unwrap();
        assert_eq!(out.included_turns, 3);
        assert_eq!(out.dropped_turns, 0);
        assert!(out.prompt.starts_with("System: sys"));
        assert!(out.prompt.ends_with("Assistant:"));
    }

    #[test]
    fn oldest_turns_are_dropped_first() {
        // Plain rendering: "System: sys" = 2, "User: seven eight nine" = 4,
        // "Assistant: five six" = 3, "User: one two three four" = 5.
        let out =
            build_budgeted_prompt(&WordCounter, ChatFormat::Plain, "sys", &conversation(), 9)
                .unwrap();
        assert_eq!(out.included_turns, 2);
        assert_eq!(out.dropped_turns, 1);
        assert_eq!(out.estimated_tokens, 9);
        assert!(!out.prompt.contains("one two"));
        let five = out.prompt.find("five").unwrap();
        let seven = out.prompt.find("seven").unwrap();
        assert!(five < seven, "kept turns stay in chronological order");
    }

    #[test]
    fn walk_stops_at_first_overflow() {
        // The middle turn does not fit, so the small oldest turn is not
        // considered even though it would.
        let turns = vec![
            Turn::user("a"),
            Turn::assistant("b c d e f g h i j k"),
            Turn::user("z"),
        ];
        let out = build_budgeted_prompt(&WordCounter, ChatFormat::Plain, "", &turns, 4).unwrap();
        assert_eq!(out.included_turns, 1);
        assert!(out.prompt.contains("User: z"));
        assert!(!out.prompt.contains("User: a"));
    }

    #[test]
    fn oversized_latest_turn_is_an_error() {
        // "System: sys" = 2 leaves 6, the question alone costs 11.
        let turns = vec![Turn::assistant("hi"), Turn::user(&"word ".repeat(10))];
        let err = build_budgeted_prompt(&WordCounter, ChatFormat::Plain, "sys", &turns, 8)
            .unwrap_err();
        assert!(matches!(err, SessionError::LatestTurnTooLong { needed: 11, available: 6 }));
    }

    #[test]
    fn latest_turn_never_dropped_for_the_system_block() {
        let err = build_budgeted_prompt(
            &WordCounter,
            ChatFormat::ChatML,
            "be brief",
            &conversation(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::LatestTurnTooLong { .. }));
    }

    #[test]
    fn system_only_prompt_without_turns() {
        let out =
            build_budgeted_prompt(&WordCounter, ChatFormat::ChatML, "be brief", &[], 1).unwrap();
        assert_eq!(out.included_turns, 0);
        assert!(out.prompt.contains("be brief"));
        assert!(out.prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn budget_reserves_generation_room() {
        assert_eq!(prompt_budget(1024, 256), 768);
        assert_eq!(prompt_budget(100, 256), 0);
    }
}
