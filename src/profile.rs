//! Voice profile table: coach persona → remote voice + session instructions.
//!
//! Pure lookup over static data. An unmapped persona is not an error — it
//! degrades to [`DEFAULT_VOICE`] so a newly added coach page works before
//! anyone remembers to extend the table.

// ── Voice lookup ─────────────────────────────────────────────────

/// Voice used when a persona has no explicit mapping.
pub const DEFAULT_VOICE: &str = "alloy";

/// Map a coach persona identifier to a remote voice identifier.
///
/// Never fails; unknown personas fall back to [`DEFAULT_VOICE`].
pub fn voice_for(persona_id: &str) -> &'static str {
    match persona_id {
        "career" => "echo",
        "fitness" => "verse",
        "mindfulness" => "sage",
        "finance" => "ballad",
        "relationships" => "coral",
        _ => DEFAULT_VOICE,
    }
}

// ── Session instructions ─────────────────────────────────────────

/// Fixed suffix appended to every persona prompt. Realtime speech output
/// is spoken aloud, so written-style formatting has to be suppressed at
/// the instruction level.
const SPOKEN_STYLE_SUFFIX: &str = "Speak naturally and conversationally. \
     Keep responses short — one or two sentences unless the user asks for \
     more. Never use markdown, lists, or headings; you are talking out \
     loud, not writing.";

/// Compose the session instructions string from a persona's behavioral
/// prompt and its voice. Pure function of its inputs.
pub fn instructions_for(base_prompt: &str, voice: &str) -> String {
    format!("{base_prompt}\n\nYour voice is \"{voice}\". {SPOKEN_STYLE_SUFFIX}")
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_personas_map_to_distinct_voices() {
        assert_eq!(voice_for("career"), "echo");
        assert_eq!(voice_for("fitness"), "verse");
        assert_eq!(voice_for("mindfulness"), "sage");
        assert_eq!(voice_for("finance"), "ballad");
        assert_eq!(voice_for("relationships"), "coral");
    }

    #[test]
    fn unknown_persona_falls_back_to_default() {
        assert_eq!(voice_for("astrology"), DEFAULT_VOICE);
        assert_eq!(voice_for(""), DEFAULT_VOICE);
    }

    #[test]
    fn instructions_carry_prompt_and_spoken_style() {
        let text = instructions_for("You are a supportive career coach.", "echo");
        assert!(text.starts_with("You are a supportive career coach."));
        assert!(text.contains("echo"));
        assert!(text.contains("Never use markdown"));
    }
}
