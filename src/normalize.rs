//! Model identifier normalization.
//!
//! OpenRouter addresses models as `<provider>/<model>`. Clients often send the
//! bare vendor name instead, so bare ids are qualified here before forwarding.

const CLAUDE_MAX_PARTS: usize = 3;

/// Rewrite a client-supplied model id into OpenRouter's `provider/model` form.
///
/// Ids that already carry a `/` pass through untouched. Claude ids are cut to
/// their first three dash-separated parts, which drops date suffixes.
#[must_use]
pub fn normalize_model_id(model_id: &str) -> String {
    if model_id.contains('/') {
        return model_id.to_string();
    }

    if model_id.contains("claude") {
        let parts: Vec<&str> = model_id.split('-').collect();
        let base = if parts.len() > CLAUDE_MAX_PARTS {
            parts[..CLAUDE_MAX_PARTS].join("-")
        } else {
            model_id.to_string()
        };
        return format!("anthropic/{base}");
    }

    if model_id.contains("gpt") {
        return format!("openai/{model_id}");
    }

    model_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_ids_pass_through() {
        for id in [
            "anthropic/claude-3-haiku-20240307",
            "openai/gpt-4o",
            "meta-llama/llama-3-70b",
            "/",
        ] {
            assert_eq!(normalize_model_id(id), id);
        }
    }

    #[test]
    fn claude_ids_are_truncated_and_prefixed() {
        assert_eq!(
            normalize_model_id("claude-3-haiku-20240307"),
            "anthropic/claude-3-haiku"
        );
        assert_eq!(
            normalize_model_id("claude-3-5-sonnet-20241022"),
            "anthropic/claude-3-5"
        );
    }

    #[test]
    fn short_claude_ids_keep_all_parts() {
        assert_eq!(normalize_model_id("claude-instant"), "anthropic/claude-instant");
        assert_eq!(normalize_model_id("claude-3-opus"), "anthropic/claude-3-opus");
    }

    #[test]
    fn gpt_ids_get_openai_prefix() {
        assert_eq!(normalize_model_id("gpt-4o"), "openai/gpt-4o");
        assert_eq!(normalize_model_id("gpt-4o-mini-2024-07-18"), "openai/gpt-4o-mini-2024-07-18");
    }

    #[test]
    fn unknown_ids_are_unchanged() {
        assert_eq!(normalize_model_id("llama-3"), "llama-3");
        assert_eq!(normalize_model_id(""), "");
    }
}
