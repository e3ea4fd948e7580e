//! Retrieval triggers: phrases in user speech that warrant recalling memories
//! or searching the web before the model answers.

use super::protocol::RetrievalTool;
use crate::services::SearchHit;

pub const RECALL_TRIGGERS: &[&str] = &[
    "记得", "上次", "之前", "以前", "还记得", "说过", "聊过", "提过", "讲过", "remember", "last time", "before",
    "mentioned", "told you",
];

pub const SEARCH_TRIGGERS: &[&str] = &[
    "新闻", "搜索", "查一下", "搜一下", "最新", "最近发生", "现在", "news", "search", "look up", "what's happening",
    "latest", "天气", "weather", "比分", "score", "股票", "stock", "帮我查", "帮我搜", "你知道", "告诉我",
];

/// Which retrieval, if any, the utterance asks for. Recall wins over search.
pub fn detect(text: &str) -> Option<RetrievalTool> {
    let lowered = text.to_lowercase();
    if RECALL_TRIGGERS.iter().any(|trigger| lowered.contains(trigger)) {
        return Some(RetrievalTool::RecallMemory);
    }
    if SEARCH_TRIGGERS.iter().any(|trigger| lowered.contains(trigger)) {
        return Some(RetrievalTool::SearchWeb);
    }
    None
}

pub fn format_recall(memories: &[String]) -> String {
    let lines: Vec<String> = memories.iter().map(|memory| format!("- {}", memory)).collect();
    format!(
        "[You recall the following; weave it into your answer naturally]:\n{}",
        lines.join("\n")
    )
}

pub fn format_search(hits: &[SearchHit]) -> String {
    let lines: Vec<String> = hits
        .iter()
        .map(|hit| format!("- {} ({}): {}", hit.title, hit.source, hit.summary))
        .collect();
    format!(
        "[Here is what you just looked up; share it with the user naturally]:\n{}",
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_triggers() {
        assert_eq!(detect("Do you REMEMBER my dog?"), Some(RetrievalTool::RecallMemory));
        assert_eq!(detect("你还记得吗"), Some(RetrievalTool::RecallMemory));
        assert_eq!(detect("any news about the weather?"), Some(RetrievalTool::SearchWeb));
        assert_eq!(detect("我想知道天气"), Some(RetrievalTool::SearchWeb));
        assert_eq!(detect("I love pancakes"), None);
    }

    #[test]
    fn test_recall_beats_search() {
        // both sets match; recall is checked first
        assert_eq!(detect("what was the news you mentioned last time?"), Some(RetrievalTool::RecallMemory));
    }

    #[test]
    fn test_formatting() {
        let recall = format_recall(&["likes tea".to_string(), "has a cat".to_string()]);
        assert!(recall.ends_with("- likes tea\n- has a cat"));

        let search = format_search(&[SearchHit {
            title: "Rain ahead".into(),
            summary: "Showers all week".into(),
            source: "Met Office".into(),
        }]);
        assert!(search.ends_with("- Rain ahead (Met Office): Showers all week"));
    }
}
