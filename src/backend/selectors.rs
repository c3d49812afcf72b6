//! CSS selectors for the AI Studio chat page.

pub const INPUT: &str = "ms-prompt-input-wrapper ms-autosize-textarea textarea";
pub const SUBMIT_BUTTON: &str = r#"button[aria-label="Run"].run-button"#;
pub const BUSY_SPINNER: &str = r#"button[aria-label="Run"].run-button svg .stoppable-spinner"#;

pub const RESPONSE_CONTAINER: &str = "ms-chat-turn .chat-turn-container.model";
pub const RESPONSE_TEXT: &str = "ms-cmark-node.cmark-node";

pub const ERROR_TOAST: &str = "div.toast.warning, div.toast.error";
pub const ERROR_TOAST_TEXT: &str = "span.content-text";

pub const CLEAR_CHAT_BUTTON: &str = r#"button[data-test-clear="outside"][aria-label="Clear chat"]"#;
/// The confirm dialog button has no stable attribute, it is matched by label.
pub const CLEAR_CHAT_CONFIRM_LABEL: &str = "Continue";
pub const OVERLAY_BUTTONS: &str = "div.cdk-overlay-container button";
