use crate::core::message::ChatMessage;

/// Token-cost estimation seam. The engine only ever needs a rough count to
/// decide when to compact or title; a real tokenizer can be plugged in by
/// the embedder.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Character-class weight heuristic: ASCII letters weigh 0.25, other ASCII
/// 0.5, everything else 1.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        let mut weight = 0.0_f64;
        for ch in text.chars() {
            if ch.is_ascii() {
                if ch.is_ascii_alphabetic() {
                    weight += 0.25;
                } else {
                    weight += 0.5;
                }
            } else {
                weight += 1.5;
            }
        }
        weight.ceil() as usize
    }
}

pub fn estimate_messages(estimator: &dyn TokenEstimator, messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|msg| estimator.estimate(&msg.content.as_text()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_letters_weigh_a_quarter() {
        let est = HeuristicEstimator;
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate(""), 0);
    }

    #[test]
    fn punctuation_weighs_half() {
        let est = HeuristicEstimator;
        // four letters (1.0) + two spaces and two dots (2.0)
        assert_eq!(est.estimate("ab cd .."), 3);
    }

    #[test]
    fn non_ascii_weighs_more() {
        let est = HeuristicEstimator;
        assert_eq!(est.estimate("日本語"), 5);
    }

    #[test]
    fn message_totals_sum_text_content() {
        let est = HeuristicEstimator;
        let messages = vec![ChatMessage::user("abcd"), ChatMessage::assistant("efgh")];
        assert_eq!(estimate_messages(&est, &messages), 2);
    }
}
