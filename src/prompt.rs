use std::collections::HashMap;

/// Sentinel that should never appear in real templates.
const ESCAPE_SENTINEL: &str = "\x00LBRACE\x00";
/// Sentinel for escaped closing brace.
const ESCAPE_SENTINEL_CLOSE: &str = "\x00RBRACE\x00";

/// Build a prompt string with variable substitution.
///
/// Replaces `{key}` placeholders with values from `vars`. Unknown
/// placeholders are left as they are.
///
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}`,
/// which keeps JSON examples in prompts intact.
///
/// # Example
///
/// ```
/// use llm_docflow::prompt::render;
/// use std::collections::HashMap;
///
/// let vars = HashMap::from([("doc_text".to_string(), "PO 4500".to_string())]);
/// let result = render("Check {doc_text}. Reply as {{\"ok\": true}}", &vars);
/// assert_eq!(result, r#"Check PO 4500. Reply as {"ok": true}"#);
/// ```
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    // Pass 1: protect escaped braces
    let mut rendered = template.replace("{{", ESCAPE_SENTINEL);
    rendered = rendered.replace("}}", ESCAPE_SENTINEL_CLOSE);

    // Pass 2: substitute placeholders
    for (key, value) in vars {
        let placeholder = format!("{{{}}}", key);
        rendered = rendered.replace(&placeholder, value);
    }

    // Pass 3: restore escaped braces
    rendered = rendered.replace(ESCAPE_SENTINEL, "{");
    rendered = rendered.replace(ESCAPE_SENTINEL_CLOSE, "}");
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_basic() {
        let result = render("Vendor {vendor}, total {total}", &vars(&[("vendor", "Acme"), ("total", "12")]));
        assert_eq!(result, "Vendor Acme, total 12");
    }

    #[test]
    fn test_render_unknown_placeholder_kept() {
        let result = render("Hello {missing}", &vars(&[]));
        assert_eq!(result, "Hello {missing}");
    }

    #[test]
    fn test_render_escaped_braces_no_substitution() {
        let result = render("Output format: {{\"result\": {{\"value\": 42}}}}", &vars(&[]));
        assert_eq!(result, r#"Output format: {"result": {"value": 42}}"#);
    }

    #[test]
    fn test_render_value_with_braces_not_reexpanded_as_escape() {
        let result = render("Data: {doc_text}", &vars(&[("doc_text", "{\"a\": 1}")]));
        assert_eq!(result, r#"Data: {"a": 1}"#);
    }
}
