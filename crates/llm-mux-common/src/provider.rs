//! Provider tag and model-ID naming conventions.
//!
//! Provider tags are normalized lowercase strings (`gemini`, `gemini-cli`,
//! `claude`, ...). A provider plus a client style is a distinct tag, so
//! `gemini-cli` and `gemini` route independently even though they reach the
//! same upstream service.

/// Normalize a provider tag: trim, lowercase.
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

/// Human-readable display name for a normalized provider tag.
///
/// Unknown tags fall back to the tag itself so new providers render without
/// a code change here.
pub fn provider_display_name(provider: &str) -> &str {
    match provider {
        "gemini" => "Gemini",
        "vertex" => "Vertex",
        "gemini-cli" => "Gemini CLI",
        "aistudio" => "AI Studio",
        "antigravity" => "Antigravity",
        "claude" => "Claude",
        "codex" => "Codex",
        "qwen" => "Qwen",
        "iflow" => "iFlow",
        "cline" => "Cline",
        "kiro" => "Kiro",
        "github-copilot" => "GitHub Copilot",
        "openai-compatibility" => "OpenAI Compatibility",
        other => other,
    }
}

/// Render a model ID with its provider prefix: `"[Gemini CLI] gemini-2.5-pro"`.
pub fn display_model_id(provider: &str, model_id: &str) -> String {
    format!("[{}] {}", provider_display_name(provider), model_id)
}

/// Strip a `"[Display Name] "` prefix if present and return the inner ID.
///
/// Prefixed IDs are accepted on input regardless of whether prefixed output
/// is enabled; requests produced from a prefixed model list must keep
/// working after the prefix toggle is flipped off.
pub fn normalize_model_id(model_id: &str) -> &str {
    let trimmed = model_id.trim();
    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some(close) = rest.find(']')
    {
        return rest[close + 1..].trim_start();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_provider_tags() {
        assert_eq!(normalize_provider("  Claude "), "claude");
        assert_eq!(normalize_provider("GEMINI-CLI"), "gemini-cli");
    }

    #[test]
    fn strips_display_prefix() {
        assert_eq!(
            normalize_model_id("[Gemini CLI] gemini-2.5-pro"),
            "gemini-2.5-pro"
        );
        assert_eq!(normalize_model_id("claude-sonnet-4"), "claude-sonnet-4");
        assert_eq!(normalize_model_id("  [Claude] claude-opus-4"), "claude-opus-4");
    }

    #[test]
    fn display_round_trips_through_normalizer() {
        let rendered = display_model_id("antigravity", "claude-sonnet-4");
        assert_eq!(rendered, "[Antigravity] claude-sonnet-4");
        assert_eq!(normalize_model_id(&rendered), "claude-sonnet-4");
    }

    #[test]
    fn unknown_provider_keeps_tag_as_display_name() {
        assert_eq!(provider_display_name("someprovider"), "someprovider");
    }
}
