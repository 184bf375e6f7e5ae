//! Desktop notifications for failures the host application would swallow.

use std::process::{Command, Stdio};

/// Show a desktop notification through `notify-send`. Best effort: returns
/// whether the notification was delivered and never fails otherwise.
pub fn send_notification(title: &str, body: &str) -> bool {
    let status = Command::new("notify-send")
        .arg("--urgency=normal")
        .arg("--app-name=tether")
        .arg(title)
        .arg(escape_markup(body))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            tracing::debug!("notify-send exited with {}", status);
            false
        }
        Err(e) => {
            tracing::debug!("Could not run notify-send: {}", e);
            false
        }
    }
}

/// Notification bodies are interpreted as markup by most daemons.
fn escape_markup(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
