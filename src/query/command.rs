//! Command protocol parser
//!
//! A request is one line of single-quoted (or bare) tokens separated by
//! spaces and ended by a terminator:
//!
//! ```text
//! '-s' 'USDUG  BHZ..' '-b' '2014/01/20 12:00:00' '-d' '60'\t
//! └── tokens ─────────────────────────────────────────────┘└ keep open
//! ```
//!
//! `\t` keeps the connection open for another command, `\n` closes it after
//! the response.

use crate::query::error::{QueryError, QueryResult};
use crate::query::filter::RingSpec;
use crate::storage::types::{julian_from_year_doy, julian_start_millis, TimeRange};
use chrono::NaiveDate;
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, one_of},
    combinator::{eof, map, opt, value},
    multi::many0,
    sequence::{delimited, preceded, terminated},
    IResult,
};
use regex::Regex;
use std::sync::OnceLock;

/// How a request line ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `\t`: answer, send the sentinel, wait for more
    KeepOpen,
    /// `\n` or end of input: answer and close
    Close,
}

/// What the request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    #[default]
    Data,
    /// `-ls`: one line per index file
    ListFiles,
    /// `-lsc`: one line per channel with its days
    ListChannels,
    /// `-lsrt`: realtime buffers
    ListRealtime,
    /// `-rt`: data from the realtime buffers instead of disk
    Realtime,
    /// `-delete`
    Delete,
}

impl QueryMode {
    pub fn is_listing(&self) -> bool {
        matches!(
            self,
            QueryMode::ListFiles | QueryMode::ListChannels | QueryMode::ListRealtime
        )
    }
}

/// A parsed request line
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCommand {
    pub mask: Option<String>,
    pub begin: Option<i64>,
    pub duration_secs: Option<f64>,
    pub end: Option<i64>,
    pub mode: QueryMode,
    pub ring: Option<RingSpec>,
    pub exclude: Option<String>,
    pub allow_deleted: bool,
    pub gaps: bool,
    /// Collect through the duplicate-suppressing result array
    pub dedup: bool,
    pub nice: Option<bool>,
    pub show_illegal: bool,
    pub terminator: Terminator,
}

impl QueryCommand {
    fn empty(terminator: Terminator) -> Self {
        Self {
            mask: None,
            begin: None,
            duration_secs: None,
            end: None,
            mode: QueryMode::Data,
            ring: None,
            exclude: None,
            allow_deleted: false,
            gaps: false,
            dedup: false,
            nice: None,
            show_illegal: false,
            terminator,
        }
    }

    /// Parse one request line
    pub fn parse(line: &str) -> QueryResult<Self> {
        let (tokens, terminator) = tokenize(line)?;
        let mut cmd = Self::empty(terminator);
        let mut iter = tokens.into_iter();

        while let Some(flag) = iter.next() {
            let mut arg = |name: &str| {
                iter.next()
                    .ok_or_else(|| QueryError::Parse(format!("{} requires an argument", name)))
            };
            match flag.as_str() {
                "-s" => cmd.mask = Some(arg("-s")?),
                "-b" => cmd.begin = Some(parse_time(&arg("-b")?)?),
                "-d" => cmd.duration_secs = Some(parse_duration(&arg("-d")?)?),
                "-ed" => cmd.end = Some(parse_time(&arg("-ed")?)?),
                "-delazc" => cmd.ring = Some(RingSpec::parse(&arg("-delazc")?)?),
                "-exclude" => cmd.exclude = Some(arg("-exclude")?),
                "-ls" => cmd.mode = QueryMode::ListFiles,
                "-lsc" => cmd.mode = QueryMode::ListChannels,
                "-lsrt" => cmd.mode = QueryMode::ListRealtime,
                "-rt" => cmd.mode = QueryMode::Realtime,
                "-delete" => cmd.mode = QueryMode::Delete,
                "-allowdeleted" => cmd.allow_deleted = true,
                "-gaps" => cmd.gaps = true,
                "-dedup" => cmd.dedup = true,
                "-nice" => cmd.nice = Some(true),
                "-nonice" => cmd.nice = Some(false),
                "-si" => cmd.show_illegal = true,
                other => {
                    return Err(QueryError::Parse(format!("unknown option {}", other)));
                }
            }
        }

        if !cmd.mode.is_listing() && cmd.mask.is_none() {
            return Err(QueryError::Parse("-s channel mask is required".to_string()));
        }
        Ok(cmd)
    }

    /// Requested `[begin, end)`; `-ed` wins over `-d`
    pub fn time_range(&self, default_duration_secs: f64) -> QueryResult<Option<TimeRange>> {
        let Some(begin) = self.begin else {
            return Ok(None);
        };
        let end = match self.end {
            Some(end) => end,
            None => {
                let secs = self.duration_secs.unwrap_or(default_duration_secs);
                let millis = (secs * 1000.0).round();
                (millis.abs() < i64::MAX as f64)
                    .then_some(millis as i64)
                    .and_then(|ms| begin.checked_add(ms))
                    .ok_or_else(|| {
                        QueryError::InvalidTimeRange(format!("duration {}s out of range", secs))
                    })?
            }
        };
        TimeRange::try_new(begin, end).map(Some).ok_or_else(|| {
            QueryError::InvalidTimeRange(format!("end {} precedes begin {}", end, begin))
        })
    }
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('\''), take_while(|c| c != '\''), char('\''))(input)
}

fn bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ' && c != '\'' && c != '\t' && c != '\n' && c != '\r')(input)
}

fn terminator(input: &str) -> IResult<&str, Terminator> {
    alt((
        value(Terminator::KeepOpen, one_of("\t")),
        value(Terminator::Close, preceded(opt(char('\r')), one_of("\n"))),
        value(Terminator::Close, eof),
    ))(input)
}

/// Token separators; tabs are terminators, not whitespace
fn spaces(input: &str) -> IResult<&str, &str> {
    take_while(|c| c == ' ')(input)
}

fn line(input: &str) -> IResult<&str, (Vec<String>, Terminator)> {
    let token = map(alt((quoted, bare)), str::to_string);
    let (input, tokens) = many0(preceded(spaces, token))(input)?;
    let (input, term) = preceded(spaces, terminated(terminator, spaces))(input)?;
    Ok((input, (tokens, term)))
}

/// Split a request line into tokens and its terminator
pub fn tokenize(input: &str) -> QueryResult<(Vec<String>, Terminator)> {
    match line(input) {
        Ok((rest, parsed)) if rest.trim().is_empty() => Ok(parsed),
        Ok((rest, _)) => Err(QueryError::Parse(format!(
            "unexpected input after terminator: '{}'",
            rest.trim()
        ))),
        Err(e) => Err(QueryError::Parse(format!("malformed command line: {:?}", e))),
    }
}

fn calendar_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4})[/-](\d{1,2})[/-](\d{1,2})(?:[ T-](\d{1,2}):(\d{1,2})(?::(\d{1,2})(\.\d+)?)?)?$",
        )
        .unwrap_or_else(|e| unreachable!("static date pattern failed to compile: {}", e))
    })
}

fn ordinal_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4}),(\d{1,3})(?:[ -](\d{1,2}):(\d{1,2})(?::(\d{1,2})(\.\d+)?)?)?$")
            .unwrap_or_else(|e| unreachable!("static date pattern failed to compile: {}", e))
    })
}

/// Parse `YYYY/MM/DD-hh:mm:ss[.fff]`, `YYYY-MM-DD hh:mm:ss` or `YYYY,DDD-hh:mm:ss` to epoch ms
pub fn parse_time(text: &str) -> QueryResult<i64> {
    let text = text.trim();
    let bad = || QueryError::Parse(format!("bad date '{}'", text));

    let (midnight, caps, first_time_group) = if let Some(caps) = calendar_pattern().captures(text) {
        let year = group_num(&caps, 1, text)? as i32;
        let month = group_num(&caps, 2, text)? as u32;
        let day = group_num(&caps, 3, text)? as u32;
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)?;
        let ms = date.and_hms_opt(0, 0, 0).ok_or_else(bad)?.and_utc().timestamp_millis();
        (ms, caps, 4)
    } else if let Some(caps) = ordinal_pattern().captures(text) {
        let year = group_num(&caps, 1, text)? as i32;
        let doy = group_num(&caps, 2, text)? as u32;
        let julian = julian_from_year_doy(year, doy).ok_or_else(bad)?;
        (julian_start_millis(julian), caps, 3)
    } else {
        return Err(bad());
    };

    let hour = group_num(&caps, first_time_group, text)?;
    let minute = group_num(&caps, first_time_group + 1, text)?;
    let second = group_num(&caps, first_time_group + 2, text)?;
    if hour > 23 || minute > 59 || second > 60 {
        return Err(bad());
    }
    let frac = caps
        .get(first_time_group + 3)
        .and_then(|m| format!("0{}", m.as_str()).parse::<f64>().ok())
        .map(|f| (f * 1000.0).round() as i64)
        .unwrap_or(0);
    Ok(midnight + ((hour * 60 + minute) * 60 + second) * 1000 + frac)
}

/// Numeric capture group; an absent optional group reads as zero
fn group_num(caps: &regex::Captures<'_>, group: usize, text: &str) -> QueryResult<i64> {
    match caps.get(group) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| QueryError::Parse(format!("bad date '{}'", text))),
        None => Ok(0),
    }
}

/// Parse `<secs>` or `<days>d`
pub fn parse_duration(text: &str) -> QueryResult<f64> {
    let text = text.trim();
    let (number, scale) = match text.strip_suffix(['d', 'D']) {
        Some(days) => (days, 86_400.0),
        None => (text, 1.0),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| QueryError::Parse(format!("bad duration '{}'", text)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(QueryError::Parse(format!("bad duration '{}'", text)));
    }
    Ok(value * scale)
}
