use std::fmt;

use chrono::NaiveDate;

use labgate_core::machine::MachineId;
use labgate_core::pagination::PageQuery;

/// Number of scans `:recent` shows without an argument.
pub const DEFAULT_RECENT: usize = 10;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A badge read from the scanner: anything that is not a `:` command.
    Badge(String),
    Unlock { machine: MachineId, badge: String },
    Machines,
    Recent(usize),
    Counts,
    /// `None` re-fetches the current page.
    Logs(Option<u32>),
    Search(PageQuery),
    Refresh,
    Logout,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Unknown(String),
    MissingArgument(&'static str),
    InvalidArgument { name: &'static str, value: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(cmd) => write!(f, "unknown command `:{cmd}`, try :help"),
            Self::MissingArgument(name) => write!(f, "missing argument <{name}>"),
            Self::InvalidArgument { name, value } => write!(f, "invalid <{name}>: {value}"),
        }
    }
}

pub const HELP: &str = "\
<badge uid>                 unlock every machine assigned to the badge
:unlock <machine> <badge>   unlock one machine on behalf of a badge
:machines                   list machines
:recent [n]                 latest badge scans
:counts                     dashboard counters
:logs [page]                access log, current or given page
:search [text] [status=..] [from=YYYY-MM-DD] [to=YYYY-MM-DD]
:refresh                    reload machines now
:logout                     clear all session state
:quit";

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Result<Self, CommandError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix(':') else {
            return Some(Ok(Self::Badge(line.to_string())));
        };

        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        Some(Self::from_parts(name, &args))
    }

    fn from_parts(name: &str, args: &[&str]) -> Result<Self, CommandError> {
        match name {
            "unlock" | "u" => {
                let machine = args
                    .first()
                    .ok_or(CommandError::MissingArgument("machine"))?;
                let badge = args.get(1).ok_or(CommandError::MissingArgument("badge"))?;
                Ok(Self::Unlock {
                    machine: number("machine", machine)?,
                    badge: (*badge).to_string(),
                })
            },
            "machines" | "m" => Ok(Self::Machines),
            "recent" | "r" => match args.first() {
                Some(n) => Ok(Self::Recent(number("n", n)?)),
                None => Ok(Self::Recent(DEFAULT_RECENT)),
            },
            "counts" | "c" => Ok(Self::Counts),
            "logs" | "l" => match args.first() {
                Some(page) => Ok(Self::Logs(Some(number("page", page)?))),
                None => Ok(Self::Logs(None)),
            },
            "search" | "s" => parse_search(args).map(Self::Search),
            "refresh" => Ok(Self::Refresh),
            "logout" => Ok(Self::Logout),
            "help" | "h" | "?" => Ok(Self::Help),
            "quit" | "q" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidArgument {
        name,
        value: value.to_string(),
    })
}

fn date(name: &'static str, value: &str) -> Result<NaiveDate, CommandError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| CommandError::InvalidArgument {
        name,
        value: value.to_string(),
    })
}

/// `key=value` words set filters, everything else is search text.
fn parse_search(args: &[&str]) -> Result<PageQuery, CommandError> {
    let mut query = PageQuery::default();
    let mut text = Vec::new();
    for arg in args {
        match arg.split_once('=') {
            Some(("status", v)) => query.status = Some(v.to_string()).filter(|s| !s.is_empty()),
            Some(("from", v)) => query.date_from = Some(date("from", v)?),
            Some(("to", v)) => query.date_to = Some(date("to", v)?),
            _ => text.push(*arg),
        }
    }
    query.search = text.join(" ");
    Ok(query)
}
