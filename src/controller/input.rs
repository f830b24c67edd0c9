//! Key and paste events from the presentation layer, and the bytes they send.

/// Interrupt (Ctrl+C)
const ETX: u8 = 0x03;
const DEL: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Enter,
    Backspace,
    Tab,
    /// Clipboard contents to forward
    Paste(String),
    /// Copy shortcut; carries the current selection if there is one
    Copy { selection: Option<String> },
    Char(char),
    /// Anything the presentation layer could not map
    Other,
}

/// What a key event turns into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Send(Vec<u8>),
    /// Put this text on the clipboard; nothing goes to the remote side
    CopyToClipboard(String),
    Ignore,
}

pub fn translate(event: &KeyEvent) -> KeyAction {
    match event {
        KeyEvent::Enter => KeyAction::Send(b"\r".to_vec()),
        KeyEvent::Backspace => KeyAction::Send(vec![DEL]),
        KeyEvent::Tab => KeyAction::Send(b"\t".to_vec()),
        KeyEvent::Paste(text) if text.is_empty() => KeyAction::Ignore,
        KeyEvent::Paste(text) => KeyAction::Send(text.as_bytes().to_vec()),
        KeyEvent::Copy {
            selection: Some(text),
        } if !text.is_empty() => KeyAction::CopyToClipboard(text.clone()),
        KeyEvent::Copy { .. } => KeyAction::Send(vec![ETX]),
        KeyEvent::Char(c) if (' '..='~').contains(c) => KeyAction::Send(vec![*c as u8]),
        KeyEvent::Char(_) | KeyEvent::Other => KeyAction::Ignore,
    }
}
