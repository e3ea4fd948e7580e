//! Keyword lexicon and relationship tables used by the heuristic classifier.
//!
//! Both English and Chinese cues are listed; matching is plain substring search
//! on the lower-cased utterance, so each occurrence of a cue counts once.

use super::{EmotionLabel, EmotionState, Intensity};

/// Ordered lexicon. On equal scores the label listed first wins.
pub const LEXICON: &[(EmotionLabel, &[&str])] = &[
    (
        EmotionLabel::Happy,
        &[
            "haha", "wonderful", "great", "glad", "awesome", "amazing", "yay", "fantastic", "brilliant",
            "delighted", "fun", "joy", "happy", "laugh", "smile", "cool", "sweet", "nice", "开心", "高兴",
            "哈哈", "不错", "棒", "太好了", "好开心",
        ],
    ),
    (
        EmotionLabel::Excited,
        &[
            "excited", "wow", "incredible", "omg", "can't wait", "thrilled", "pumped", "stoked",
            "unbelievable", "insane", "let's go", "太棒了", "激动", "兴奋", "天啊", "厉害", "震惊",
        ],
    ),
    (
        EmotionLabel::Sad,
        &[
            "sorry", "unfortunately", "sad", "miss", "lost", "difficult", "tough", "heartbreaking", "regret",
            "painful", "grief", "cry", "tears", "难过", "伤心", "可惜", "遗憾", "想念", "心疼", "委屈",
        ],
    ),
    (
        EmotionLabel::Angry,
        &[
            "unfair", "annoyed", "upset", "furious", "angry", "outrageous", "ridiculous", "unacceptable",
            "terrible", "hate", "生气", "烦", "讨厌", "气死", "受不了", "过分",
        ],
    ),
    (
        EmotionLabel::Anxious,
        &[
            "worried", "nervous", "anxious", "scared", "afraid", "stress", "uneasy", "concerned", "panic",
            "overwhelmed", "tense", "担心", "紧张", "焦虑", "害怕", "不安", "压力",
        ],
    ),
    (
        EmotionLabel::Loving,
        &[
            "love", "adore", "cherish", "care about", "precious", "sweetheart", "darling", "dear", "miss you",
            "warm", "affection", "tender", "hug", "喜欢你", "爱你", "想你", "在乎你", "心疼你", "亲爱的", "宝贝",
        ],
    ),
    (
        EmotionLabel::Surprised,
        &[
            "really", "no way", "what", "seriously", "unexpected", "didn't expect", "oh my", "shocking",
            "whoa", "真的吗", "不会吧", "没想到", "居然", "竟然", "吓到",
        ],
    ),
    (
        EmotionLabel::Thinking,
        &[
            "hmm", "let me think", "consider", "interesting", "perhaps", "maybe", "could be", "wonder",
            "actually", "on the other hand", "嗯", "这个嘛", "让我想想", "有意思", "也许", "好像",
        ],
    ),
    (
        EmotionLabel::Jealous,
        &[
            "jealous", "girlfriend", "boyfriend", "dating someone", "seeing someone", "other girl",
            "other guy", "who is she", "who is he", "don't like her", "don't like him", "mine",
            "belong to me", "flirting", "cheating", "why her", "why him", "吃醋", "女朋友", "男朋友",
            "其他女生", "其他男生", "她是谁", "他是谁", "你是我的", "不许", "别跟她", "别跟他", "醋意", "嫉妒",
        ],
    ),
    (
        EmotionLabel::Shy,
        &[
            "blush", "shy", "awkward", "flattered", "stop it", "don't say that", "you're making me",
            "too much", "oh stop", "you're sweet", "害羞", "不好意思", "脸红", "别说了", "讨厌啦", "人家",
            "哎呀", "羞死了", "你真会说",
        ],
    ),
    (
        EmotionLabel::Disappointed,
        &[
            "disappointed", "let down", "expected more", "not what i hoped", "underwhelming", "letdown",
            "hoped for", "失望", "不满意", "不如预期",
        ],
    ),
    (
        EmotionLabel::Frustrated,
        &[
            "frustrating", "frustrated", "ugh", "so annoying", "stuck", "can't figure out", "nothing works",
            "give up", "烦死了", "搞不定", "好烦",
        ],
    ),
    (
        EmotionLabel::Proud,
        &[
            "proud", "nailed it", "crushed it", "achievement", "accomplished", "did it", "i'm so good",
            "look what i did", "骄傲", "自豪", "厉害了",
        ],
    ),
    (
        EmotionLabel::Grateful,
        &[
            "grateful", "thankful", "appreciate", "thanks so much", "means a lot", "blessed", "so kind",
            "感恩", "感谢", "谢谢你", "太感谢",
        ],
    ),
    (
        EmotionLabel::Bored,
        &[
            "bored", "boring", "dull", "nothing to do", "meh", "whatever", "yawn", "so tired of", "无聊",
            "没意思", "好闷",
        ],
    ),
    (
        EmotionLabel::Curious,
        &[
            "curious", "tell me more", "how does", "why does", "i wonder", "what if", "fascinating", "好奇",
            "想知道", "怎么回事",
        ],
    ),
    (
        EmotionLabel::Embarrassed,
        &[
            "embarrassed", "embarrassing", "cringe", "so awkward", "want to disappear", "mortified",
            "humiliating", "尴尬", "丢人", "好丢脸",
        ],
    ),
    (
        EmotionLabel::Playful,
        &[
            "hehe", "tease", "playful", "just kidding", "gotcha", "bet you can't", "catch me", "wanna play",
            "嘻嘻", "逗你的", "来玩",
        ],
    ),
    (
        EmotionLabel::Lonely,
        &[
            "lonely", "alone", "no one", "nobody", "by myself", "miss someone", "isolated", "all alone",
            "孤独", "寂寞", "一个人",
        ],
    ),
    (
        EmotionLabel::Confused,
        &[
            "confused", "don't understand", "makes no sense", "huh", "lost me", "wait what",
            "i'm so confused", "困惑", "搞不懂", "什么意思",
        ],
    ),
];

/// Emotion a relationship leans toward when the utterance itself is flat.
pub fn relationship_bias(relationship_type: &str) -> Option<EmotionLabel> {
    let label = match relationship_type {
        "Romantic Partner" => EmotionLabel::Loving,
        "Ex-Partner" => EmotionLabel::Sad,
        "Best Friend" | "Friend" | "Companion" => EmotionLabel::Happy,
        "Mentor" | "Confidant" | "Critic" | "Study Buddy" | "Advisor" => EmotionLabel::Thinking,
        "Rival" => EmotionLabel::Excited,
        "Frenemy" => EmotionLabel::Surprised,
        "Nemesis" => EmotionLabel::Angry,
        "Stranger" | "Acquaintance" | "Colleague" => EmotionLabel::Neutral,
        _ => return None,
    };
    Some(label)
}

/// Starting mood for a character that has never spoken to this user.
pub fn relationship_seed(relationship_type: &str) -> Option<EmotionState> {
    let (valence, arousal, label) = match relationship_type {
        "Romantic Partner" => (0.6, 0.5, EmotionLabel::Loving),
        "Best Friend" => (0.5, 0.4, EmotionLabel::Happy),
        "Friend" | "Companion" => (0.3, 0.3, EmotionLabel::Happy),
        "Mentor" | "Confidant" | "Study Buddy" | "Advisor" => (0.2, 0.3, EmotionLabel::Thinking),
        "Rival" => (0.1, 0.5, EmotionLabel::Excited),
        "Frenemy" => (0.0, 0.4, EmotionLabel::Surprised),
        "Nemesis" => (-0.2, 0.5, EmotionLabel::Angry),
        "Critic" => (0.0, 0.3, EmotionLabel::Thinking),
        "Ex-Partner" => (-0.3, 0.4, EmotionLabel::Sad),
        "Stranger" => (0.0, 0.2, EmotionLabel::Neutral),
        "Acquaintance" | "Colleague" => (0.1, 0.2, EmotionLabel::Neutral),
        _ => return None,
    };

    // the table label is the character's stance, not the nearest point
    Some(EmotionState {
        valence,
        arousal,
        label,
        intensity: Intensity::from_arousal(arousal),
    })
}

/// Score the utterance against the lexicon and fall back to relationship bias.
pub fn heuristic_label(text: &str, relationship_type: Option<&str>, familiarity: u8) -> EmotionLabel {
    let lowered = text.to_lowercase();

    let mut best = EmotionLabel::Neutral;
    let mut best_score = 0usize;
    for (label, keywords) in LEXICON {
        let score = keywords.iter().filter(|keyword| lowered.contains(*keyword)).count();
        if score > best_score {
            best_score = score;
            best = *label;
        }
    }

    if best_score > 0 {
        return best;
    }

    let bias = relationship_type.and_then(relationship_bias);
    match bias {
        Some(label) if familiarity >= 7 => label,
        Some(label) if familiarity >= 4 && text.chars().count() > 20 => label,
        _ => EmotionLabel::Neutral,
    }
}
