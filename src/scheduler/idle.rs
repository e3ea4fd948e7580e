//! Prompts used to restart a conversation that has gone quiet.

/// Rotates through the fallback prompts; a topical prompt wins whenever news is cached.
#[derive(Debug, Clone, Default)]
pub struct IdleRotation {
    turn: usize,
}

impl IdleRotation {
    pub fn next_prompt(&mut self, has_news: bool, region: &str) -> String {
        if has_news {
            return "Things have gone a bit quiet. Bring up something interesting naturally, \
                    like a recent news story, or ask how the user's day is going."
                .to_string();
        }

        let prompt = if self.turn % 2 == 0 {
            "Share something you find interesting, or ask the user a light, easy question.".to_string()
        } else {
            format!(
                "Talk about something fun that happened in {} lately, or ask what it's like where the user is.",
                region
            )
        };
        self.turn += 1;
        prompt
    }
}
