//! Parser for the human-readable output of `systemctl status <unit>`.

use nom::{
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, opt},
    sequence::{delimited, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse state shown for a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Running,
    Stopped,
    Failed,
    #[default]
    Unknown,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Fields extracted from `systemctl status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStatus {
    /// False when systemd reports the unit as unknown.
    pub found: bool,
    pub active_state: Option<String>,
    pub sub_state: Option<String>,
    pub enabled: bool,
    pub main_pid: Option<u32>,
    pub since: Option<String>,
}

impl ParsedStatus {
    /// `active (running)` and `active (exited)` both count as running.
    pub fn running(&self) -> bool {
        self.active_state.as_deref() == Some("active")
            && matches!(self.sub_state.as_deref(), Some("running") | Some("exited"))
    }

    pub fn state(&self) -> UnitState {
        if self.running() {
            return UnitState::Running;
        }
        match self.active_state.as_deref() {
            Some("inactive") => UnitState::Stopped,
            Some("failed") => UnitState::Failed,
            _ => UnitState::Unknown,
        }
    }
}

struct ActiveLine<'a> {
    state: &'a str,
    sub: Option<&'a str>,
    since: Option<&'a str>,
}

fn active_line(input: &str) -> IResult<&str, ActiveLine<'_>> {
    let (input, _) = tag("Active:")(input)?;
    let (input, _) = space1(input)?;
    let (input, state) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-')(input)?;
    let (input, _) = space0(input)?;
    let (input, sub) = opt(delimited(char('('), take_until(")"), char(')')))(input)?;
    let (input, since) = opt(preceded(
        preceded(space0, tag("since ")),
        take_while(|c: char| c != ';'),
    ))(input)?;
    Ok((input, ActiveLine { state, sub, since }))
}

/// `Loaded: loaded (/path/unit.service; enabled; preset: enabled)` -> `enabled`
fn loaded_line(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("Loaded:")(input)?;
    let (input, _) = take_until("(")(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = take_while(|c: char| c != ';' && c != ')')(input)?;
    let (input, _) = char(';')(input)?;
    let (input, _) = space0(input)?;
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-')(input)
}

fn main_pid_line(input: &str) -> IResult<&str, u32> {
    let (input, _) = tag("Main PID:")(input)?;
    let (input, _) = space0(input)?;
    map_res(digit1, str::parse::<u32>)(input)
}

/// Parse the full output of `systemctl status`. Unknown lines are ignored.
pub fn parse_systemctl_status(output: &str) -> ParsedStatus {
    let mut parsed = ParsedStatus {
        found: !(output.contains("could not be found") || output.contains("not-found")),
        ..Default::default()
    };

    for raw in output.lines() {
        let line = raw.trim_start();
        if let Ok((_, active)) = active_line(line) {
            parsed.active_state = Some(active.state.to_string());
            parsed.sub_state = active.sub.map(str::to_string);
            parsed.since = active
                .since
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        } else if let Ok((_, state)) = loaded_line(line) {
            parsed.enabled = state == "enabled";
        } else if let Ok((_, pid)) = main_pid_line(line) {
            parsed.main_pid = Some(pid).filter(|&p| p > 0);
        }
    }

    parsed
}

/// Parse `ps -o %cpu=,%mem=` output into (cpu, mem) percentages.
pub fn parse_ps_usage(output: &str) -> Option<(f32, f32)> {
    let mut fields = output.split_whitespace();
    let cpu = fields.next()?.parse().ok()?;
    let mem = fields.next()?.parse().ok()?;
    Some((cpu, mem))
}
