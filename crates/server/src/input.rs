//! Input injection through `adb shell input`.
//!
//! Event coordinates arrive in stream pixels and are mapped to device pixels
//! with the session's resolutions before they reach the device.

use droidmirror_protocol::InputEvent;

use crate::adb::{Adb, AdbError};
use crate::session::MirrorSession;

pub async fn inject(
    adb: &dyn Adb,
    session: &MirrorSession,
    event: &InputEvent,
) -> Result<(), AdbError> {
    let Some(args) = input_args(session, event) else {
        return Ok(());
    };
    let mut full = vec!["shell", "input"];
    full.extend(args.iter().map(String::as_str));
    adb.run(Some(session.device_id.as_str()), &full).await?;
    tracing::debug!(device_id = %session.device_id, ?event, "Input injected");
    Ok(())
}

/// Arguments after `input`, or `None` when there is nothing to send.
fn input_args(session: &MirrorSession, event: &InputEvent) -> Option<Vec<String>> {
    let args = match event {
        InputEvent::Tap { x, y } => {
            let (x, y) = session.map_point(*x, *y);
            vec!["tap".to_string(), x.to_string(), y.to_string()]
        }
        InputEvent::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms,
        } => {
            let (x1, y1) = session.map_point(*x1, *y1);
            let (x2, y2) = session.map_point(*x2, *y2);
            vec![
                "swipe".to_string(),
                x1.to_string(),
                y1.to_string(),
                x2.to_string(),
                y2.to_string(),
                duration_ms.to_string(),
            ]
        }
        InputEvent::Key { keycode } => vec!["keyevent".to_string(), keycode.to_string()],
        InputEvent::Text { text } => {
            let escaped = escape_text(text);
            if escaped.is_empty() {
                return None;
            }
            vec!["text".to_string(), escaped]
        }
    };
    Some(args)
}

/// `input text` reads `%s` as a space, and the argument goes through the
/// device shell, so its metacharacters need a backslash.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\\' | '\'' | '"' | '`' | '$' | '!' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*'
            | '?' | '#' | '~' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            // Not typeable through `input text`.
            '\n' | '\r' | '\t' => {}
            _ => out.push(c),
        }
    }
    out
}
