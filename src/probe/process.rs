//! External `ping` utility backend.
//!
//! Used when ICMP sockets are not available to the process. Every probe is a
//! child process (`ping -c 1`) whose textual output is parsed into a reply.
//! Latency comes from the utility's own `time=` field, so process start-up
//! cost does not inflate the RTT, but jitter is higher than the socket backend.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::probe::{ProbeBackend, ProbeRequest, Reply, ReplyKind, ReplySender};

struct Running {
    replies: ReplySender,
    runtime: Handle,
    cancel: CancellationToken,
}

/// Probe backend that shells out to a ping utility
pub struct ProcessBackend {
    command: String,
    ipv6: bool,
    running: Mutex<Option<Running>>,
}

impl ProcessBackend {
    pub fn new(command: impl Into<String>, ipv6: bool) -> Self {
        Self {
            command: command.into(),
            ipv6,
            running: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::Process
    }
}

impl ProbeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn open(&self, replies: ReplySender) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let runtime = Handle::try_current()
            .map_err(|e| Error::BackendUnavailable(format!("no async runtime: {e}")))?;

        // Only a failure to spawn matters; `-V` is not understood everywhere.
        // The child is reaped on the runtime so `open` never waits on it.
        let _enter = runtime.enter();
        let mut check = Command::new(&self.command)
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::BackendUnavailable(format!("cannot run `{}`: {e}", self.command))
            })?;
        runtime.spawn(async move {
            let _ = check.wait().await;
        });

        *running = Some(Running {
            replies,
            runtime,
            cancel: CancellationToken::new(),
        });
        tracing::debug!(command = %self.command, "process backend opened");
        Ok(())
    }

    fn send(&self, request: &ProbeRequest) -> Result<()> {
        let (replies, runtime, cancel) = match self.running.lock().as_ref() {
            Some(r) => (r.replies.clone(), r.runtime.clone(), r.cancel.clone()),
            None => return Err(Error::NotRunning),
        };

        let mut command = Command::new(&self.command);
        command
            .args(ping_args(request, self.ipv6))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let request = request.clone();
        runtime.spawn(async move {
            let output = tokio::select! {
                _ = cancel.cancelled() => return,
                output = command.output() => output,
            };
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        address = %request.address,
                        "ping utility failed to run"
                    );
                    return;
                }
            };

            let text = String::from_utf8_lossy(&output.stdout);
            let Some(parsed) = parse_ping_output(&text) else {
                // No answer inside the utility's wait; the matcher times it out
                return;
            };
            let received_at = match parsed.rtt {
                Some(rtt) => request.sent_at + rtt,
                None => Instant::now(),
            };
            let _ = replies.send(Reply {
                sequence: request.sequence,
                destination: Some(request.address),
                responder: parsed.responder.unwrap_or(request.address),
                received_at,
                kind: parsed.kind,
            });
        });
        Ok(())
    }

    fn close(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            tracing::debug!(command = %self.command, "process backend closed");
        }
    }
}

/// Whole seconds to wait, rounded up, at least one
fn wait_secs(timeout: Duration) -> u64 {
    timeout.as_millis().div_ceil(1000).max(1) as u64
}

/// Command line for a single probe
fn ping_args(request: &ProbeRequest, ipv6: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(10);
    if ipv6 {
        args.push("-6".to_string());
    }
    args.push("-n".to_string());
    args.extend(["-c".to_string(), "1".to_string()]);

    #[cfg(target_os = "macos")]
    {
        // BSD ping: -m sets the TTL, -W waits in milliseconds
        args.extend(["-m".to_string(), request.ttl.to_string()]);
        args.extend(["-W".to_string(), request.timeout.as_millis().to_string()]);
    }
    #[cfg(not(target_os = "macos"))]
    {
        args.extend(["-t".to_string(), request.ttl.to_string()]);
        args.extend(["-W".to_string(), wait_secs(request.timeout).to_string()]);
    }

    args.push(request.address.to_string());
    args
}

/// Reply extracted from ping utility output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPing {
    pub kind: ReplyKind,
    pub responder: Option<IpAddr>,
    pub rtt: Option<Duration>,
}

/// Parse the first reply line of `ping -n -c 1` output
///
/// Understands the iputils and BSD formats:
/// - `64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.2 ms`
/// - `From 10.0.0.1 icmp_seq=1 Time to live exceeded`
/// - `92 bytes from 10.0.0.1: Time to live exceeded`
/// - `From 10.0.0.1 icmp_seq=1 Destination Host Unreachable`
pub fn parse_ping_output(text: &str) -> Option<ParsedPing> {
    for line in text.lines() {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();

        if lower.contains("time to live exceeded") || lower.contains("time exceeded") {
            return Some(ParsedPing {
                kind: ReplyKind::TtlExceeded,
                responder: parse_from_address(line),
                rtt: None,
            });
        }

        if lower.contains("unreachable") {
            return Some(ParsedPing {
                kind: ReplyKind::Unreachable(unreachable_code(&lower)),
                responder: parse_from_address(line),
                rtt: None,
            });
        }

        if lower.contains("bytes from") && lower.contains("time=") {
            return Some(ParsedPing {
                kind: ReplyKind::EchoReply,
                responder: parse_from_address(line),
                rtt: parse_time_field(line),
            });
        }
    }
    None
}

/// Address following the word "from", tolerating `host (addr)` and trailing colons
fn parse_from_address(line: &str) -> Option<IpAddr> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if !token.eq_ignore_ascii_case("from") {
            continue;
        }
        for candidate in tokens.by_ref().take(2) {
            let cleaned = candidate
                .trim_start_matches('(')
                .trim_end_matches([')', ':', ',']);
            if let Ok(ip) = cleaned.parse() {
                return Some(ip);
            }
        }
        return None;
    }
    None
}

/// Value of `time=<ms>` (also `time<1`)
fn parse_time_field(line: &str) -> Option<Duration> {
    let start = line.find("time=").map(|i| i + 5).or_else(|| line.find("time<").map(|i| i + 5))?;
    let value: String = line[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let millis: f64 = value.parse().ok()?;
    if millis.is_finite() && millis >= 0.0 {
        Some(Duration::from_secs_f64(millis / 1000.0))
    } else {
        None
    }
}

/// ICMP destination unreachable code from its textual description
fn unreachable_code(lower: &str) -> u8 {
    if lower.contains("net unreachable") || lower.contains("network unreachable") {
        0
    } else if lower.contains("protocol unreachable") {
        2
    } else if lower.contains("port unreachable") {
        3
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TargetId;
    use std::net::Ipv4Addr;

    const ECHO_OUTPUT: &str = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.2 ms

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 11.200/11.200/11.200/0.000 ms
";

    const TTL_EXCEEDED_OUTPUT: &str = "\
PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
From 192.168.1.1 icmp_seq=1 Time to live exceeded

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms
";

    const BSD_TTL_EXCEEDED_OUTPUT: &str = "\
PING 8.8.8.8 (8.8.8.8): 56 data bytes
92 bytes from 10.0.0.1: Time to live exceeded
Vr HL TOS  Len   ID Flg  off TTL Pro  cks      Src      Dst
";

    const UNREACHABLE_OUTPUT: &str = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.
From 10.0.0.1 icmp_seq=1 Destination Host Unreachable
";

    const TIMEOUT_OUTPUT: &str = "\
PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.

--- 10.9.9.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";

    #[test]
    fn test_parse_echo_reply() {
        let parsed = parse_ping_output(ECHO_OUTPUT).unwrap();
        assert_eq!(parsed.kind, ReplyKind::EchoReply);
        assert_eq!(parsed.responder, Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
        assert_eq!(parsed.rtt, Some(Duration::from_micros(11_200)));
    }

    #[test]
    fn test_parse_ttl_exceeded() {
        let parsed = parse_ping_output(TTL_EXCEEDED_OUTPUT).unwrap();
        assert_eq!(parsed.kind, ReplyKind::TtlExceeded);
        assert_eq!(parsed.responder, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert_eq!(parsed.rtt, None);

        let parsed = parse_ping_output(BSD_TTL_EXCEEDED_OUTPUT).unwrap();
        assert_eq!(parsed.kind, ReplyKind::TtlExceeded);
        assert_eq!(parsed.responder, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_parse_unreachable() {
        let parsed = parse_ping_output(UNREACHABLE_OUTPUT).unwrap();
        assert_eq!(parsed.kind, ReplyKind::Unreachable(1));
        assert_eq!(parsed.responder, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_timeout_output_yields_nothing() {
        assert_eq!(parse_ping_output(TIMEOUT_OUTPUT), None);
        assert_eq!(parse_ping_output(""), None);
    }

    #[test]
    fn test_hostname_with_address_in_parentheses() {
        let line = "64 bytes from one.one.one.one (1.1.1.1): icmp_seq=1 ttl=57 time<1 ms";
        let parsed = parse_ping_output(line).unwrap();
        assert_eq!(parsed.responder, Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
        assert_eq!(parsed.rtt, Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_ipv6_responder() {
        let line = "64 bytes from ::1: icmp_seq=1 ttl=64 time=0.045 ms";
        let parsed = parse_ping_output(line).unwrap();
        assert_eq!(parsed.responder, Some("::1".parse().unwrap()));
        assert_eq!(parsed.rtt, Some(Duration::from_micros(45)));
    }

    #[test]
    fn test_unreachable_codes() {
        assert_eq!(unreachable_code("destination net unreachable"), 0);
        assert_eq!(unreachable_code("destination port unreachable"), 3);
        assert_eq!(unreachable_code("destination host unreachable"), 1);
    }

    #[tokio::test]
    async fn test_open_missing_command_is_unavailable() {
        let backend = ProcessBackend::new("hopwatch-no-such-ping-utility", false);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(matches!(backend.open(tx), Err(Error::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_open_returns_without_waiting_for_check() {
        // `sleep -V` prints its version and exits; `open` must not wait for it
        let backend = ProcessBackend::new("sleep", false);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        backend.open(tx).unwrap();
        assert!(backend.running.lock().is_some());
        backend.close();
        assert!(backend.running.lock().is_none());
    }

    #[test]
    fn test_open_outside_runtime_is_unavailable() {
        let backend = ProcessBackend::new("sleep", false);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(matches!(backend.open(tx), Err(Error::BackendUnavailable(_))));
    }

    #[test]
    fn test_wait_rounds_up() {
        assert_eq!(wait_secs(Duration::from_millis(1)), 1);
        assert_eq!(wait_secs(Duration::from_millis(1500)), 2);
        assert_eq!(wait_secs(Duration::from_secs(3)), 3);
    }

    #[test]
    fn test_ping_args_carry_ttl_and_address() {
        let request = ProbeRequest {
            target: TargetId(1),
            address: IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            sequence: 4,
            ttl: 7,
            sent_at: Instant::now(),
            timeout: Duration::from_secs(2),
        };
        let args = ping_args(&request, false);
        assert_eq!(args.last().map(String::as_str), Some("9.9.9.9"));
        assert!(args.contains(&"7".to_string()));
        assert!(!args.contains(&"-6".to_string()));
        assert!(ping_args(&request, true).contains(&"-6".to_string()));
    }
}
