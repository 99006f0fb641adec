//! Line protocol spoken with battle workers.
//!
//! One worker runs one battle at a time:
//!
//! 1. worker -> pool, once at startup: [`READY_SIGNAL`]
//! 2. pool -> worker: participant names joined by `,`, challenger first
//! 3. worker -> pool: any number of diagnostic lines, then one line starting with
//!    [`RESULT_SIGNAL`]. The rest of that line holds one tuple per participant, tuples joined by
//!    [`BOT_DELIMITER`], fields joined by [`SCORE_DELIMITER`]:
//!    `name::score::survivalFirsts::survivalScore::bulletDamage[::energyConserved]`
//!
//! Raw strings never leave this module: results are parsed into [`RobotScore`]s right here.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ProtocolFault, StartupFault};
use crate::score::RobotScore;

/// Sent once by a worker when its engine is loaded.
pub const READY_SIGNAL: &str = "BattleProcess ready";
/// Prefix of the line carrying a battle's scores.
pub const RESULT_SIGNAL: &str = "BATTLE RESULT: ";
/// Separates participant tuples in a result line.
pub const BOT_DELIMITER: &str = ":::";
/// Separates the fields of one tuple.
pub const SCORE_DELIMITER: &str = "::";

/// Bounds on a single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeLimits {
    /// `None` waits forever, like a worker with no timeout.
    pub battle_timeout: Option<Duration>,
    /// Diagnostic lines tolerated before the result marker.
    pub max_noise_lines: usize,
}

impl Default for ExchangeLimits {
    fn default() -> Self {
        ExchangeLimits {
            battle_timeout: None,
            max_noise_lines: 100_000,
        }
    }
}

/// Request line for a battle, newline included.
pub fn encode_request(participants: &[String]) -> String {
    let mut line = participants.join(",");
    line.push('\n');
    line
}

/// True for a line carrying battle scores.
pub fn is_battle_result(line: &str) -> bool {
    line.starts_with(RESULT_SIGNAL)
}

/// Parses a full result line (marker included) into one score per participant.
pub fn parse_result_line(line: &str) -> Result<Vec<RobotScore>, ProtocolFault> {
    let body = line
        .strip_prefix(RESULT_SIGNAL)
        .ok_or_else(|| ProtocolFault::malformed(line, "missing result marker"))?
        .trim_end_matches(['\r', '\n']);
    if body.trim().is_empty() {
        return Err(ProtocolFault::malformed(line, "no participant scores"));
    }

    body.split(BOT_DELIMITER)
        .map(|tuple| parse_tuple(line, tuple))
        .collect()
}

fn parse_tuple(line: &str, tuple: &str) -> Result<RobotScore, ProtocolFault> {
    let fields = tuple.split(SCORE_DELIMITER).collect::<Vec<_>>();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(ProtocolFault::malformed(
            line,
            format!("expected 5 or 6 fields in '{tuple}', got {}", fields.len()),
        ));
    }
    let name = fields[0].trim();
    if name.is_empty() {
        return Err(ProtocolFault::malformed(line, "empty participant name"));
    }
    let number = |i: usize| -> Result<f64, ProtocolFault> {
        let raw = fields[i].trim();
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(ProtocolFault::malformed(
                line,
                format!("field {i} of '{name}' is not a number: '{raw}'"),
            )),
        }
    };
    let score = RobotScore::new(name, number(1)?, number(2)?, number(3)?, number(4)?);
    Ok(if fields.len() == 6 {
        score.with_energy_conserved(number(5)?)
    } else {
        score
    })
}

/// Reads `reader` line by line on a background thread.
///
/// The receiver disconnects once the stream reaches EOF, which is how a dead worker shows up.
pub fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    label: String,
) -> Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("lines-{label}"))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|e| debug!("could not spawn line reader for {label}: {e}"));
    rx
}

enum LineError {
    Timeout,
    Closed,
    Io(io::Error),
}

/// Client side of the protocol for one worker.
#[derive(Debug)]
pub struct ProtocolClient<W: Write> {
    writer: W,
    lines: Receiver<io::Result<String>>,
    label: String,
}

impl<W: Write> ProtocolClient<W> {
    /// `label` names the worker in logs and errors (usually its engine install).
    pub fn new(writer: W, lines: Receiver<io::Result<String>>, label: String) -> Self {
        ProtocolClient {
            writer,
            lines,
            label,
        }
    }

    /// Name of the worker in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Blocks until the worker sends [`READY_SIGNAL`]. Earlier lines are skipped.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), StartupFault> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next_line(Some(deadline)) {
                Ok(line) if line.trim_end() == READY_SIGNAL => {
                    debug!(worker = %self.label, "worker ready");
                    return Ok(());
                }
                Ok(line) => trace!(worker = %self.label, "startup output: {line}"),
                Err(LineError::Timeout) => {
                    return Err(StartupFault::Timeout {
                        install: self.label.clone(),
                        timeout,
                    })
                }
                Err(LineError::Closed | LineError::Io(_)) => {
                    return Err(StartupFault::Exited {
                        install: self.label.clone(),
                    })
                }
            }
        }
    }

    /// Sends one battle request and waits for its result line.
    pub fn exchange(
        &mut self,
        participants: &[String],
        limits: &ExchangeLimits,
    ) -> Result<Vec<RobotScore>, ProtocolFault> {
        let request = encode_request(participants);
        self.writer.write_all(request.as_bytes())?;
        self.writer.flush()?;

        let deadline = limits.battle_timeout.map(|t| Instant::now() + t);
        let mut noise = 0usize;
        loop {
            let line = match self.next_line(deadline) {
                Ok(line) => line,
                Err(LineError::Timeout) => {
                    return Err(ProtocolFault::Timeout(limits.battle_timeout.unwrap_or_default()))
                }
                Err(LineError::Closed) => return Err(ProtocolFault::WorkerExited),
                Err(LineError::Io(e)) => return Err(ProtocolFault::Io(e)),
            };
            if is_battle_result(&line) {
                return parse_result_line(&line);
            }
            trace!(worker = %self.label, "{line}");
            noise += 1;
            if noise > limits.max_noise_lines {
                return Err(ProtocolFault::TooMuchNoise(noise));
            }
        }
    }

    fn next_line(&mut self, deadline: Option<Instant>) -> Result<String, LineError> {
        let received = match deadline {
            None => self.lines.recv().map_err(|_| LineError::Closed)?,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                self.lines.recv_timeout(left).map_err(|e| match e {
                    RecvTimeoutError::Timeout => LineError::Timeout,
                    RecvTimeoutError::Disconnected => LineError::Closed,
                })?
            }
        };
        received.map_err(LineError::Io)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn client(output: &str) -> ProtocolClient<Vec<u8>> {
        let lines = spawn_line_reader(Cursor::new(output.as_bytes().to_vec()), "test".into());
        ProtocolClient::new(Vec::new(), lines, "test".into())
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn request_is_comma_joined_challenger_first() {
        let req = encode_request(&names(&["me.Bot 1.0", "you.Bot 2.0"]));
        assert_eq!(req, "me.Bot 1.0,you.Bot 2.0\n");
    }

    #[test]
    fn parse_two_participants() {
        let line = "BATTLE RESULT: me 1.0::3520::30::1500::1620.5:::you 2.0::1200::5::250::900";
        let scores = parse_result_line(line).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].name, "me 1.0");
        assert_eq!(scores[0].score, 3520.0);
        assert_eq!(scores[0].survival_firsts, 30.0);
        assert_eq!(scores[0].survival_score, 1500.0);
        assert_eq!(scores[0].bullet_damage, 1620.5);
        assert_eq!(scores[0].energy_conserved, 0.0);
        assert_eq!(scores[1].name, "you 2.0");
    }

    #[test]
    fn parse_optional_energy_field() {
        let scores = parse_result_line("BATTLE RESULT: me::1::2::3::4::5.5").unwrap();
        assert_eq!(scores[0].energy_conserved, 5.5);
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = parse_result_line("BATTLE RESULT: me::1::2::3").unwrap_err();
        assert!(matches!(err, ProtocolFault::Malformed { .. }), "{err}");
    }

    #[test]
    fn non_numeric_field_is_malformed() {
        let err = parse_result_line("BATTLE RESULT: me::1::two::3::4").unwrap_err();
        assert!(matches!(err, ProtocolFault::Malformed { .. }), "{err}");
    }

    #[test]
    fn empty_result_is_malformed() {
        assert!(parse_result_line("BATTLE RESULT: ").is_err());
        assert!(parse_result_line("something else").is_err());
    }

    #[test]
    fn exchange_skips_noise_and_writes_request() {
        let mut c = client("Processing me,you\nBattle completed ok\nBATTLE RESULT: me::1::2::3::4:::you::5::6::7::8\n");
        let scores = c
            .exchange(&names(&["me", "you"]), &ExchangeLimits::default())
            .unwrap();
        assert_eq!(scores[1].score, 5.0);
        assert_eq!(String::from_utf8(c.writer.clone()).unwrap(), "me,you\n");
    }

    #[test]
    fn exchange_reports_exited_worker() {
        let mut c = client("Processing me,you\n");
        let err = c
            .exchange(&names(&["me", "you"]), &ExchangeLimits::default())
            .unwrap_err();
        assert!(matches!(err, ProtocolFault::WorkerExited), "{err}");
    }

    #[test]
    fn exchange_bounds_noise() {
        let mut c = client("a\nb\nc\nBATTLE RESULT: me::1::2::3::4\n");
        let limits = ExchangeLimits {
            battle_timeout: None,
            max_noise_lines: 2,
        };
        let err = c.exchange(&names(&["me"]), &limits).unwrap_err();
        assert!(matches!(err, ProtocolFault::TooMuchNoise(3)), "{err}");
    }

    #[test]
    fn exchange_times_out() {
        let (_tx, rx) = mpsc::channel::<io::Result<String>>();
        let mut c = ProtocolClient::new(Vec::new(), rx, "silent".into());
        let limits = ExchangeLimits {
            battle_timeout: Some(Duration::from_millis(20)),
            max_noise_lines: 10,
        };
        let err = c.exchange(&names(&["me"]), &limits).unwrap_err();
        assert!(matches!(err, ProtocolFault::Timeout(_)), "{err}");
    }

    #[test]
    fn ready_skips_startup_output() {
        let mut c = client("loading engine\nBattleProcess ready\n");
        c.wait_ready(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn ready_fails_when_worker_exits() {
        let mut c = client("usage: engine -path <dir>\n");
        let err = c.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, StartupFault::Exited { .. }), "{err}");
    }
}
