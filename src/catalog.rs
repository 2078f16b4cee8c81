use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// The closed set of scanning tools the orchestrator knows how to drive.
///
/// Declaration order is the catalog order, which is also used as the
/// tie-break wherever runs of several tools need a stable ordering.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Nmap,
    Sqlmap,
    Xsstrike,
    Gobuster,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Nmap,
        ToolKind::Sqlmap,
        ToolKind::Xsstrike,
        ToolKind::Gobuster,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Nmap => "nmap",
            ToolKind::Sqlmap => "sqlmap",
            ToolKind::Xsstrike => "xsstrike",
            ToolKind::Gobuster => "gobuster",
        }
    }

    pub fn definition(self) -> &'static ToolDefinition {
        match self {
            ToolKind::Nmap => &NMAP,
            ToolKind::Sqlmap => &SQLMAP,
            ToolKind::Xsstrike => &XSSTRIKE,
            ToolKind::Gobuster => &GOBUSTER,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ToolKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ScanError::UnknownTool(s.to_string()))
    }
}

/// A boolean switch appended verbatim when selected.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagParam {
    pub name: &'static str,
    pub flag: &'static str,
    pub description: &'static str,
}

/// How a keyed input's value is validated.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputKind {
    Text,
    Number { min: Option<i64>, max: Option<i64> },
    Range { min: i64, max: i64, step: i64 },
    /// Comma separated ports and inclusive ranges, every port in 1..=65535.
    Ports,
}

/// A `key value` pair appended after the flags.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedInput {
    pub key: &'static str,
    pub description: &'static str,
    pub placeholder: &'static str,
    pub default: &'static str,
    pub required: bool,
    #[serde(flatten)]
    pub kind: InputKind,
}

/// Static catalog entry for one tool.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct ToolDefinition {
    pub tool: ToolKind,
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    /// Whitespace separated argv template; `{domain}` is substituted per target.
    pub template: &'static str,
    pub flags: &'static [FlagParam],
    pub inputs: &'static [KeyedInput],
    pub examples: &'static [&'static str],
}

impl ToolDefinition {
    pub fn flag(&self, token: &str) -> Option<&FlagParam> {
        self.flags.iter().find(|f| f.flag == token)
    }

    pub fn input(&self, key: &str) -> Option<&KeyedInput> {
        self.inputs.iter().find(|i| i.key == key)
    }
}

/// All tool definitions in catalog order.
pub fn all() -> Vec<&'static ToolDefinition> {
    ToolKind::ALL.into_iter().map(ToolKind::definition).collect()
}

const fn flag(name: &'static str, flag: &'static str, description: &'static str) -> FlagParam {
    FlagParam {
        name,
        flag,
        description,
    }
}

const fn text(key: &'static str, description: &'static str, placeholder: &'static str) -> KeyedInput {
    KeyedInput {
        key,
        description,
        placeholder,
        default: "",
        required: false,
        kind: InputKind::Text,
    }
}

static NMAP: ToolDefinition = ToolDefinition {
    tool: ToolKind::Nmap,
    name: "Nmap",
    description: "Network mapper: host discovery, port scanning and service detection",
    category: "Network security",
    template: "nmap {domain}",
    flags: &[
        flag("TCP SYN scan", "-sS", "Half-open TCP scan to classify ports as open or closed"),
        flag("UDP scan", "-sU", "Probe UDP ports"),
        flag("OS detection", "-O", "Fingerprint the remote operating system"),
        flag("Version detection", "-sV", "Detect service versions on open ports"),
        flag("Aggressive", "-A", "Enable OS detection, version detection, scripts and traceroute"),
        flag("Timing T4", "-T4", "Faster timing template"),
    ],
    inputs: &[
        KeyedInput {
            key: "-p",
            description: "Ports to scan",
            placeholder: "e.g. 80,443,8080 or 1-1000",
            default: "",
            required: false,
            kind: InputKind::Ports,
        },
        text("--script", "NSE script name or category", "e.g. vuln, auth, default"),
        KeyedInput {
            key: "--host-timeout",
            description: "Give up on a host after this many milliseconds",
            placeholder: "e.g. 30000",
            default: "",
            required: false,
            kind: InputKind::Number {
                min: Some(1),
                max: None,
            },
        },
    ],
    examples: &[
        "nmap example.com -sS -p 80,443,8080",
        "nmap example.com -O -sV",
        "nmap example.com -A --script vuln",
    ],
};

static SQLMAP: ToolDefinition = ToolDefinition {
    tool: ToolKind::Sqlmap,
    name: "SQLMap",
    description: "Automatic SQL injection detection and database takeover",
    category: "Web security",
    template: "sqlmap -u https://{domain}",
    flags: &[
        flag("Enumerate databases", "--dbs", "List available databases"),
        flag("Batch mode", "--batch", "Never ask for user input, use default behaviour"),
        flag("Random agent", "--random-agent", "Use a randomly selected User-Agent"),
        flag("Enumerate tables", "--tables", "List tables of the database"),
        flag("Enumerate columns", "--columns", "List columns of the table"),
        flag("Dump", "--dump", "Dump table entries"),
    ],
    inputs: &[
        KeyedInput {
            key: "--level",
            description: "Level of tests to perform (1-5)",
            placeholder: "1-5",
            default: "1",
            required: false,
            kind: InputKind::Range {
                min: 1,
                max: 5,
                step: 1,
            },
        },
        KeyedInput {
            key: "--risk",
            description: "Risk of tests to perform (1-3)",
            placeholder: "1-3",
            default: "1",
            required: false,
            kind: InputKind::Range {
                min: 1,
                max: 3,
                step: 1,
            },
        },
        KeyedInput {
            key: "--threads",
            description: "Max number of concurrent HTTP requests",
            placeholder: "e.g. 4",
            default: "",
            required: false,
            kind: InputKind::Number {
                min: Some(1),
                max: Some(10),
            },
        },
        KeyedInput {
            key: "--timeout",
            description: "Seconds to wait before timing out a connection",
            placeholder: "e.g. 30",
            default: "",
            required: false,
            kind: InputKind::Number {
                min: Some(1),
                max: None,
            },
        },
        KeyedInput {
            key: "--retries",
            description: "Retries when the connection times out",
            placeholder: "e.g. 3",
            default: "",
            required: false,
            kind: InputKind::Number {
                min: Some(0),
                max: None,
            },
        },
        text("-D", "Database to enumerate", "e.g. testdb"),
        text("-T", "Table to enumerate", "e.g. users"),
        text("-C", "Columns to enumerate", "e.g. username,password"),
        text("--dbms", "Force the back-end DBMS", "e.g. mysql, postgresql, mssql"),
    ],
    examples: &[
        "sqlmap -u https://example.com --dbs",
        "sqlmap -u https://example.com --batch --random-agent",
        "sqlmap -u https://example.com --tables -D database_name",
    ],
};

static XSSTRIKE: ToolDefinition = ToolDefinition {
    tool: ToolKind::Xsstrike,
    name: "XSStrike",
    description: "Cross-site scripting detection suite",
    category: "Web security",
    template: "xsstrike -u https://{domain}",
    flags: &[
        flag("Crawl", "--crawl", "Crawl the target and test every discovered page"),
        flag("Blind XSS", "--blind", "Inject blind XSS payloads while crawling"),
        flag("Skip DOM", "--skip-dom", "Skip DOM XSS checks"),
        flag("Skip payloads", "--skip", "Do not ask before continuing with payloads"),
        flag("JSON", "--json", "Treat post data as JSON"),
    ],
    inputs: &[
        text("--params", "Parameters to test", "e.g. q,id,search"),
        text("--headers", "Extra HTTP headers", "e.g. User-Agent,Referer"),
        text("--cookies", "Cookies to send", "e.g. session,user"),
        KeyedInput {
            key: "--threads",
            description: "Number of threads",
            placeholder: "e.g. 10",
            default: "10",
            required: false,
            kind: InputKind::Number {
                min: Some(1),
                max: Some(50),
            },
        },
    ],
    examples: &[
        "xsstrike -u https://example.com --crawl",
        "xsstrike -u https://example.com --blind",
    ],
};

static GOBUSTER: ToolDefinition = ToolDefinition {
    tool: ToolKind::Gobuster,
    name: "Gobuster",
    description: "Directory and file brute forcing",
    category: "Reconnaissance",
    template: "gobuster dir -u https://{domain}",
    flags: &[
        flag("Follow redirects", "--follow-redirect", "Follow HTTP redirects"),
        flag("Skip TLS verification", "--no-tls-validation", "Do not verify TLS certificates"),
        flag("Random agent", "--random-agent", "Use a random User-Agent string"),
        flag("Expanded", "--expanded", "Print full URLs"),
    ],
    inputs: &[
        KeyedInput {
            key: "-w",
            description: "Path to the wordlist",
            placeholder: "e.g. /usr/share/wordlists/dirb/common.txt",
            default: "/usr/share/wordlists/dirb/common.txt",
            required: true,
            kind: InputKind::Text,
        },
        KeyedInput {
            key: "-t",
            description: "Number of concurrent threads",
            placeholder: "e.g. 10",
            default: "10",
            required: false,
            kind: InputKind::Number {
                min: Some(1),
                max: Some(100),
            },
        },
        text("-x", "File extensions to search for", "e.g. php,html,txt,js"),
        text("--status-codes", "Positive status codes", "e.g. 200,204,301,302,307,401,403"),
        KeyedInput {
            key: "--exclude-length",
            description: "Exclude responses of this content length",
            placeholder: "e.g. 0",
            default: "",
            required: false,
            kind: InputKind::Number {
                min: Some(0),
                max: None,
            },
        },
    ],
    examples: &[
        "gobuster dir -u https://example.com -w /usr/share/wordlists/dirb/common.txt",
        "gobuster dir -u https://example.com -w wordlist.txt -x php,html,txt",
    ],
};
