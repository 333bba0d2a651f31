//! Line grammar for the emulator console.
//!
//! ```text
//! connect | disconnect | wake | sleep | status | trace | help
//! params <latency>
//! cmd <id> [<byte> ...]        hex, e.g. `cmd 10 b4 00 4b 00 1e 5a`
//! read <response|status|battery|activity|error|raw>
//! advance <n>[ms|s]
//! samples <n> | rollover <timestamp> | busy <n> | battery <mv>
//! ```

use core::time::Duration;

use tracker_core::drivers::Characteristic;
use winnow::ascii::{Caseless, dec_uint, space0, space1};
use winnow::combinator::{alt, eof, opt, preceded, separated, terminated};
use winnow::prelude::*;
use winnow::token::take_while;

/// One parsed console line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Directive {
    Connect,
    Disconnect,
    /// The central applied a new slave latency.
    Params(u16),
    Command { id: u8, payload: Vec<u8> },
    Read(Characteristic),
    Advance(Duration),
    /// Motion interrupt while asleep.
    Wake,
    /// Host asks the device to sleep.
    Sleep,
    /// Queue `n` sensor samples and raise data-ready for each.
    Samples(u16),
    Rollover(u32),
    /// The next `n` radio requests report busy.
    Busy(u16),
    Battery(u16),
    Status,
    Trace,
    Help,
}

pub const HELP: &[&str] = &[
    "connect | disconnect          - peer link events",
    "params <latency>              - central applies a slave latency",
    "cmd <id> [bytes..]            - write a protocol command (hex)",
    "read <characteristic>         - peer reads a characteristic",
    "advance <n>[ms|s]             - move the clock, firing due timers",
    "samples <n>                   - deliver sensor samples",
    "wake | sleep                  - motion wake-up / sleep request",
    "rollover <ts>                 - day rollover with timestamp",
    "busy <n>                      - next n radio requests report busy",
    "battery <mv>                  - set the battery reading",
    "status | trace | help | exit",
];

/// Parses one trimmed console line.
///
/// # Errors
///
/// Returns the rendered parse error when the line is not a directive.
pub fn parse_line(line: &str) -> Result<Directive, String> {
    terminated(directive, (space0, eof))
        .parse(line.trim())
        .map_err(|err| err.to_string())
}

fn directive(input: &mut &str) -> ModalResult<Directive> {
    alt((
        preceded((Caseless("params"), space1), dec_uint).map(Directive::Params),
        command,
        preceded((Caseless("read"), space1), characteristic).map(Directive::Read),
        preceded((Caseless("advance"), space1), duration).map(Directive::Advance),
        preceded((Caseless("samples"), space1), dec_uint).map(Directive::Samples),
        preceded((Caseless("rollover"), space1), dec_uint).map(Directive::Rollover),
        preceded((Caseless("busy"), space1), dec_uint).map(Directive::Busy),
        preceded((Caseless("battery"), space1), dec_uint).map(Directive::Battery),
        Caseless("disconnect").value(Directive::Disconnect),
        Caseless("connect").value(Directive::Connect),
        Caseless("wake").value(Directive::Wake),
        Caseless("sleep").value(Directive::Sleep),
        Caseless("status").value(Directive::Status),
        Caseless("trace").value(Directive::Trace),
        Caseless("help").value(Directive::Help),
    ))
    .parse_next(input)
}

fn hex_byte(input: &mut &str) -> ModalResult<u8> {
    take_while(1..=2, |c: char| c.is_ascii_hexdigit())
        .try_map(|digits| u8::from_str_radix(digits, 16))
        .parse_next(input)
}

fn command(input: &mut &str) -> ModalResult<Directive> {
    let id = preceded((Caseless("cmd"), space1), hex_byte).parse_next(input)?;
    let payload: Option<Vec<u8>> =
        opt(preceded(space1, separated(1.., hex_byte, space1))).parse_next(input)?;
    Ok(Directive::Command {
        id,
        payload: payload.unwrap_or_default(),
    })
}

fn characteristic(input: &mut &str) -> ModalResult<Characteristic> {
    alt((
        Caseless("response").value(Characteristic::Response),
        Caseless("status").value(Characteristic::Status),
        Caseless("battery").value(Characteristic::Battery),
        Caseless("activity").value(Characteristic::Activity),
        Caseless("error").value(Characteristic::LastError),
        Caseless("raw").value(Characteristic::RawData),
    ))
    .parse_next(input)
}

fn duration(input: &mut &str) -> ModalResult<Duration> {
    let amount: u64 = dec_uint.parse_next(input)?;
    let scale = opt(alt((Caseless("ms").value(1u64), Caseless("s").value(1_000u64))))
        .parse_next(input)?
        .unwrap_or(1);
    Ok(Duration::from_millis(amount.saturating_mul(scale)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_are_hex() {
        assert_eq!(
            parse_line("cmd 10 b4 00 4B 00 1e 5a"),
            Ok(Directive::Command {
                id: 0x10,
                payload: vec![0xB4, 0x00, 0x4B, 0x00, 0x1E, 0x5A],
            })
        );
        assert_eq!(
            parse_line("CMD 1"),
            Ok(Directive::Command {
                id: 0x01,
                payload: Vec::new(),
            })
        );
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(
            parse_line("advance 2s"),
            Ok(Directive::Advance(Duration::from_secs(2)))
        );
        assert_eq!(
            parse_line("advance 250ms"),
            Ok(Directive::Advance(Duration::from_millis(250)))
        );
        assert_eq!(
            parse_line("advance 40"),
            Ok(Directive::Advance(Duration::from_millis(40)))
        );
    }

    #[test]
    fn keywords_do_not_shadow_each_other() {
        assert_eq!(parse_line("disconnect"), Ok(Directive::Disconnect));
        assert_eq!(parse_line("connect  "), Ok(Directive::Connect));
        assert_eq!(parse_line("status"), Ok(Directive::Status));
        assert_eq!(
            parse_line("read status"),
            Ok(Directive::Read(Characteristic::Status))
        );
        assert_eq!(parse_line("params 4"), Ok(Directive::Params(4)));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse_line("connect now").is_err());
        assert!(parse_line("cmd 10 xyz").is_err());
        assert!(parse_line("cmd 100").is_err());
        assert!(parse_line("read nothing").is_err());
    }
}
