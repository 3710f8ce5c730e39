//! Contact menu text protocol: parser and response generator.
//!
//! The protocol is line oriented and meant for humans on `nc`/`telnet`:
//! - Server greets with a banner, the numbered contact list and a prompt
//! - Client sends one line per selection
//! - `q`, `quit` or `exit` closes the session
//! - A number in range reveals that contact's URL

use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use std::fmt::Write as _;

const BANNER: &str = r"
 _     _ _   _
| |__ (_) |_| |_ ___
| '_ \| | __| __/ _ \
| | | | | |_| || (_) |
|_| |_|_|\__|\__\___/

━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
  Welcome to hitto's contact server
━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

  Available endpoints:

";

const SEPARATOR: &str = "\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n";

/// Sent to a client rejected by the per-address rate limiter.
pub const RATE_LIMITED: &[u8] = b"Too many connections. Please wait and try again.\n";

/// Sent to a client rejected because every admission slot is taken.
pub const SERVER_BUSY: &[u8] = b"Server is busy. Please try again later.\n";

/// Sent before closing a session whose input line exceeded the size cap.
pub const INPUT_TOO_LARGE: &[u8] = b"\nInput too large. Connection closed.\n";

/// Sent when the client asks to quit.
pub const FAREWELL: &[u8] = "\nConnection closed. See you! 👋\n".as_bytes();

/// A single menu entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Contact {
    /// Number shown in the menu
    pub index: usize,
    pub label: String,
    /// URL without scheme, as displayed in the menu
    pub url: String,
}

impl Contact {
    fn new(index: usize, label: &str, url: &str) -> Self {
        Self {
            index,
            label: label.to_string(),
            url: url.to_string(),
        }
    }

    /// URL handed to the client on selection
    pub fn resolved_url(&self) -> String {
        format!("https://{}", self.url)
    }
}

/// The built-in contact list
pub fn default_contacts() -> Vec<Contact> {
    vec![
        Contact::new(1, "Twitter/X", "x.com/hitto_kun"),
        Contact::new(2, "GitHub", "github.com/hitto-hub"),
        Contact::new(3, "Zenn", "zenn.dev/hitto"),
        Contact::new(4, "Qiita", "qiita.com/hitto"),
        Contact::new(5, "Blog", "hitto-kun.hatenablog.com"),
    ]
}

/// Parsed client input line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Close the session
    Quit,
    /// Menu selection, not yet range checked
    Select(i64),
    /// Anything else
    Invalid,
}

/// Parser for menu input lines
pub struct Parser;

impl Parser {
    /// Parse one input line (terminator already stripped).
    ///
    /// Quit words match exactly and case-sensitively. Selections accept
    /// leading whitespace, an optional sign and a run of digits; anything
    /// after the digits is ignored.
    pub fn parse(line: &str) -> Command {
        match line {
            "q" | "quit" | "exit" => return Command::Quit,
            _ => {}
        }

        match parse_leading_int(line) {
            Some(n) => Command::Select(n),
            None => Command::Invalid,
        }
    }
}

fn parse_leading_int(line: &str) -> Option<i64> {
    let s = line.trim_start();
    let bytes = s.as_bytes();

    let sign_len = usize::from(matches!(bytes.first(), Some(b'+') | Some(b'-')));
    let digits = bytes[sign_len..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }

    // Overflow is treated as not-a-number
    s[..sign_len + digits].parse().ok()
}

/// The menu served to every session
#[derive(Debug, Clone)]
pub struct Menu {
    contacts: Vec<Contact>,
}

impl Menu {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self { contacts }
    }

    fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Look up a selection by the number shown next to the entry
    pub fn select(&self, n: i64) -> Option<&Contact> {
        let n = usize::try_from(n).ok()?;
        self.contacts.iter().find(|c| c.index == n)
    }

    /// Banner, contact list and first prompt
    pub fn greeting(&self) -> BytesMut {
        let mut out = String::with_capacity(1024);
        out.push_str(BANNER);
        for c in &self.contacts {
            let _ = writeln!(out, "  [{}] {:<10} → {}", c.index, c.label, c.url);
        }
        out.push_str(SEPARATOR);
        out.push_str(&self.prompt());
        BytesMut::from(out.as_bytes())
    }

    /// Prompt shown after each answer
    pub fn prompt(&self) -> String {
        format!("> Select [1-{}] or 'q' to quit: ", self.len())
    }

    /// Reveal a contact and prompt again
    pub fn reveal(&self, contact: &Contact) -> BytesMut {
        let mut out = BytesMut::with_capacity(128);
        out.put_slice(
            format!("\n→ Opening {}: {}\n\n", contact.label, contact.resolved_url()).as_bytes(),
        );
        out.put_slice(self.prompt().as_bytes());
        out
    }

    /// Reply to an unrecognized or out-of-range line
    pub fn invalid(&self) -> BytesMut {
        BytesMut::from(
            format!("Invalid input. Select [1-{}] or 'q' to quit: ", self.len()).as_bytes(),
        )
    }
}

impl Default for Menu {
    fn default() -> Self {
        Self::new(default_contacts())
    }
}
