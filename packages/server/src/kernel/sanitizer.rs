// Text sanitizer implementations

use super::traits::BaseTextSanitizer;

/// Default sanitizer: drops control characters, keeps everything else.
///
/// Markdown and formula handling happen in the client.
pub struct PassthroughSanitizer;

impl PassthroughSanitizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PassthroughSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseTextSanitizer for PassthroughSanitizer {
    fn sanitize(&self, text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_control_characters_but_keeps_layout() {
        let sanitizer = PassthroughSanitizer::new();
        let out = sanitizer.sanitize("Tarief:\t9%\u{0}\r\n- horeca\u{1b}");
        assert_eq!(out, "Tarief:\t9%\n- horeca");
    }

    #[test]
    fn markdown_is_untouched() {
        let sanitizer = PassthroughSanitizer::new();
        assert_eq!(sanitizer.sanitize("**9%** $x^2$"), "**9%** $x^2$");
    }
}
