//! Per-connection menu session.
//!
//! A session greets the client once, then answers one line at a time until
//! the client quits, sends an oversized line, disconnects, or runs out of
//! time. Two deadlines apply:
//! - an absolute deadline `conn_timeout` after the session starts
//! - a rolling read deadline `read_timeout` after each prompt
//!
//! Whichever comes first ends the wait for input. Only an oversized line
//! gets an error message; every other failure closes the connection
//! without a word.

use crate::config::Config;
use crate::protocol::{Command, Menu, Parser, FAREWELL, INPUT_TOO_LARGE};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Limits applied to every session
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Longest accepted line, terminator excluded
    pub max_input_size: usize,
    /// Absolute session lifetime
    pub conn_timeout: Duration,
    /// Idle time allowed between lines
    pub read_timeout: Duration,
}

impl From<&Config> for SessionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_input_size: config.max_input_size,
            conn_timeout: config.conn_timeout,
            read_timeout: config.read_timeout,
        }
    }
}

/// How a session ended without a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client asked to quit
    Quit,
    /// Client sent a line over the size cap
    InputTooLarge,
    /// Client closed its side
    Disconnected,
    /// A read or connection deadline passed
    TimedOut,
}

/// One input line read from the client
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Complete(String),
    TooLarge,
    Eof,
}

/// Run the menu session on `stream` until it ends.
///
/// Transport errors are returned to the caller, which treats them the same
/// as any other silent close.
pub async fn handle_connection<S>(
    stream: S,
    menu: &Menu,
    limits: &SessionLimits,
) -> io::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = deadline_after(limits.conn_timeout);
    let mut stream = BufReader::new(stream);
    let mut line = BytesMut::with_capacity(limits.max_input_size.min(4096) + 2);

    send(&mut stream, &menu.greeting(), deadline).await?;

    loop {
        let read_deadline = deadline.min(deadline_after(limits.read_timeout));

        let input = match timeout_at(
            read_deadline,
            read_line(&mut stream, &mut line, limits.max_input_size),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                trace!("Read deadline passed");
                return Ok(SessionEnd::TimedOut);
            }
        };

        let input = match input {
            Line::Complete(input) => input,
            Line::TooLarge => {
                warn!(limit = limits.max_input_size, "Input size limit exceeded");
                send(&mut stream, INPUT_TOO_LARGE, deadline).await?;
                return Ok(SessionEnd::InputTooLarge);
            }
            Line::Eof => {
                trace!("Connection closed by client");
                return Ok(SessionEnd::Disconnected);
            }
        };

        match Parser::parse(&input) {
            Command::Quit => {
                send(&mut stream, FAREWELL, deadline).await?;
                return Ok(SessionEnd::Quit);
            }
            Command::Select(n) => match menu.select(n) {
                Some(contact) => {
                    debug!(contact = %contact.label, "Contact selected");
                    send(&mut stream, &menu.reveal(contact), deadline).await?;
                }
                None => send(&mut stream, &menu.invalid(), deadline).await?,
            },
            Command::Invalid => send(&mut stream, &menu.invalid(), deadline).await?,
        }
    }
}

/// `now + timeout`, saturating at a point roughly 30 years out
fn deadline_after(timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// Write a whole response before the absolute deadline
async fn send<W>(writer: &mut W, data: &[u8], deadline: Instant) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout_at(deadline, writer.write_all(data)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection deadline passed while writing",
        )),
    }
}

/// Read one `\n` terminated line holding at most `max` bytes.
///
/// A `\r` right before the `\n` is stripped and not counted. Memory use is
/// bounded: reading stops as soon as the line cannot fit. An unterminated
/// line at EOF is returned as complete.
async fn read_line<R>(reader: &mut R, buf: &mut BytesMut, max: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();

    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(Line::Eof);
                }
                return Ok(finish_line(buf, max));
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if found {
            return Ok(finish_line(buf, max));
        }

        // One extra byte may still be a `\r` belonging to the terminator
        if buf.len() > max.saturating_add(1) {
            return Ok(Line::TooLarge);
        }
    }
}

fn finish_line(buf: &mut BytesMut, max: usize) -> Line {
    if buf.last() == Some(&b'\r') {
        buf.truncate(buf.len() - 1);
    }

    if buf.len() > max {
        return Line::TooLarge;
    }

    Line::Complete(String::from_utf8_lossy(buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio_test::{assert_err, assert_ok};

    fn limits() -> SessionLimits {
        SessionLimits {
            max_input_size: 1024,
            conn_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
        }
    }

    /// Start a session on one end of an in-memory pipe and return the other end
    fn spawn_session(
        limits: SessionLimits,
    ) -> (DuplexStream, tokio::task::JoinHandle<io::Result<SessionEnd>>) {
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let menu = Menu::default();
            handle_connection(server, &menu, &limits).await
        });
        (client, handle)
    }

    async fn read_all(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn greeting() -> String {
        String::from_utf8(Menu::default().greeting().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_select_then_quit() {
        let (mut client, handle) = spawn_session(limits());
        client.write_all(b"3\nq\n").await.unwrap();

        let output = read_all(&mut client).await;
        let expected = format!(
            "{}\n→ Opening Zenn: https://zenn.dev/hitto\n\n> Select [1-5] or 'q' to quit: \nConnection closed. See you! 👋\n",
            greeting()
        );
        assert_eq!(output, expected);
        assert_eq!(assert_ok!(handle.await.unwrap()), SessionEnd::Quit);
    }

    #[tokio::test]
    async fn test_out_of_range_is_invalid() {
        let (mut client, handle) = spawn_session(limits());
        client.write_all(b"0\n99\nquit\n").await.unwrap();

        let output = read_all(&mut client).await;
        let invalid = "Invalid input. Select [1-5] or 'q' to quit: ";
        assert_eq!(output.matches(invalid).count(), 2);
        assert!(output.ends_with("See you! 👋\n"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Quit);
    }

    #[tokio::test]
    async fn test_text_is_invalid_and_exit_quits() {
        let (mut client, handle) = spawn_session(limits());
        client.write_all(b"hello\r\nexit\r\n").await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.contains("Invalid input."));
        assert!(output.ends_with("See you! 👋\n"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Quit);
    }

    #[tokio::test]
    async fn test_line_at_size_limit_is_accepted() {
        let mut limits = limits();
        limits.max_input_size = 8;
        let (mut client, handle) = spawn_session(limits);

        client.write_all(b"00000002\nq\n").await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.contains("→ Opening GitHub: https://github.com/hitto-hub"));
        assert!(!output.contains("Input too large"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Quit);
    }

    #[tokio::test]
    async fn test_line_over_size_limit_closes() {
        let mut limits = limits();
        limits.max_input_size = 8;
        let (mut client, handle) = spawn_session(limits);

        client.write_all(b"000000002\nq\n").await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.ends_with("\nInput too large. Connection closed.\n"));
        assert!(!output.contains("Opening"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::InputTooLarge);
    }

    #[tokio::test]
    async fn test_unterminated_flood_closes_without_buffering_it_all() {
        let (mut client, handle) = spawn_session(limits());

        // Far past the limit with no newline; the session must stop early
        let flood = vec![b'a'; 32 * 1024];
        client.write_all(&flood).await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.ends_with("Input too large. Connection closed.\n"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::InputTooLarge);
    }

    #[tokio::test]
    async fn test_disconnect_is_silent() {
        let (mut client, handle) = spawn_session(limits());
        client.shutdown().await.unwrap();

        let output = read_all(&mut client).await;
        assert_eq!(output, greeting());
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_processed() {
        let (mut client, handle) = spawn_session(limits());
        client.write_all(b"1").await.unwrap();
        client.shutdown().await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.contains("→ Opening Twitter/X: https://x.com/hitto_kun"));
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_times_out_silently() {
        let (mut client, handle) = spawn_session(limits());

        let start = Instant::now();
        let output = read_all(&mut client).await;
        assert_eq!(output, greeting());
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_input_cannot_outlive_connection_deadline() {
        let (mut client, handle) = spawn_session(limits());

        let start = Instant::now();
        let writer = tokio::spawn(async move {
            let mut client = client;
            let mut output = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                // Keep well inside the rolling read deadline
                tokio::time::sleep(Duration::from_secs(20)).await;
                if client.write_all(b"1\n").await.is_err() {
                    break;
                }
                while let Ok(Ok(n)) =
                    tokio::time::timeout(Duration::from_millis(10), client.read(&mut buf)).await
                {
                    if n == 0 {
                        return output;
                    }
                    output.extend_from_slice(&buf[..n]);
                }
            }
            output
        });

        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));

        let output = String::from_utf8(writer.await.unwrap()).unwrap();
        assert!(output.matches("→ Opening Twitter/X").count() >= 2);
    }

    #[tokio::test]
    async fn test_read_error_ends_session_without_reply() {
        let menu = Menu::default();
        let mock = tokio_test::io::Builder::new()
            .write(&menu.greeting())
            .read(b"4\n")
            .write(&menu.reveal(menu.select(4).unwrap()))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let result = handle_connection(mock, &menu, &limits()).await;
        let err = assert_err!(result);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_limits_still_serve() {
        let limits = SessionLimits {
            max_input_size: usize::MAX,
            conn_timeout: Duration::MAX,
            read_timeout: Duration::from_secs(u64::MAX),
        };
        let (mut client, handle) = spawn_session(limits);
        client.write_all(b"1
q
").await.unwrap();

        let output = read_all(&mut client).await;
        assert!(output.starts_with(&greeting()));
        assert!(output.contains("→ Opening Twitter/X"));
        assert_eq!(assert_ok!(handle.await.unwrap()), SessionEnd::Quit);
    }

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) > before + Duration::from_secs(86400 * 365));
        assert!(deadline_after(Duration::from_secs(5)) >= before + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_read_line_without_size_cap() {
        let mut reader = BufReader::with_capacity(1, &b"abcdef
"[..]);
        let mut buf = BytesMut::new();
        assert_eq!(
            read_line(&mut reader, &mut buf, usize::MAX).await.unwrap(),
            Line::Complete("abcdef".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_line_strips_crlf() {
        let mut reader = BufReader::new(&b"abc\r\nxyz\n"[..]);
        let mut buf = BytesMut::new();

        assert_eq!(
            read_line(&mut reader, &mut buf, 3).await.unwrap(),
            Line::Complete("abc".to_string())
        );
        assert_eq!(
            read_line(&mut reader, &mut buf, 3).await.unwrap(),
            Line::Complete("xyz".to_string())
        );
        assert_eq!(read_line(&mut reader, &mut buf, 3).await.unwrap(), Line::Eof);
    }

    #[tokio::test]
    async fn test_read_line_limit_across_small_reads() {
        // A one-byte buffer forces the line to arrive in pieces
        let mut reader = BufReader::with_capacity(1, &b"abcd\n"[..]);
        let mut buf = BytesMut::new();
        assert_eq!(
            read_line(&mut reader, &mut buf, 3).await.unwrap(),
            Line::TooLarge
        );

        let mut reader = BufReader::with_capacity(1, &b"abc\r\n"[..]);
        assert_eq!(
            read_line(&mut reader, &mut buf, 3).await.unwrap(),
            Line::Complete("abc".to_string())
        );
    }
}
