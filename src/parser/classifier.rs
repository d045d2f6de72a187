use crate::datasource::TxOptions;

/// Command family of a raw query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    BeginTransaction,
    Commit,
    Rollback,
    Prepare,
    Execute,
    Deallocate,
    PlainQuery,
}

impl CommandKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::BeginTransaction => "begin",
            CommandKind::Commit => "commit",
            CommandKind::Rollback => "rollback",
            CommandKind::Prepare => "prepare",
            CommandKind::Execute => "execute",
            CommandKind::Deallocate => "deallocate",
            CommandKind::PlainQuery => "query",
        }
    }
}

/// Classify a raw query into its command family
///
/// Looks only at the leading keywords, skipping whitespace and comments.
/// Anything not recognised is a `PlainQuery`.
pub fn classify(sql: &str) -> CommandKind {
    let words = keywords(sql, 4);
    let word = |i: usize| words.get(i).map(String::as_str);

    match word(0) {
        // BEGIN NOT ATOMIC etc. opens a compound statement, not a transaction
        Some("BEGIN") if matches!(word(1), None | Some("WORK")) => CommandKind::BeginTransaction,
        Some("START") if word(1) == Some("TRANSACTION") => CommandKind::BeginTransaction,
        Some("COMMIT") => CommandKind::Commit,
        // ROLLBACK TO SAVEPOINT stays inside the transaction
        Some("ROLLBACK") if !words.iter().any(|w| w == "TO") => CommandKind::Rollback,
        Some("PREPARE") => CommandKind::Prepare,
        Some("EXECUTE") => CommandKind::Execute,
        Some("DEALLOCATE") | Some("DROP") if word(1) == Some("PREPARE") => CommandKind::Deallocate,
        _ => CommandKind::PlainQuery,
    }
}

/// Transaction options spelled out in a `START TRANSACTION` statement
pub fn begin_options(sql: &str) -> TxOptions {
    let words = keywords(sql, 16);
    let mut opts = TxOptions::default();

    if words.len() < 2 || words[0] != "START" || words[1] != "TRANSACTION" {
        return opts;
    }

    let mut i = 2;
    while i < words.len() {
        match (words[i].as_str(), words.get(i + 1).map(String::as_str)) {
            ("READ", Some("ONLY")) => {
                opts.read_only = true;
                i += 2;
            }
            ("READ", Some("WRITE")) => {
                opts.read_only = false;
                i += 2;
            }
            ("WITH", Some("CONSISTENT")) => {
                opts.consistent_snapshot = true;
                i += 3;
            }
            _ => i += 1,
        }
    }
    opts
}

/// Leading keywords of `sql`, upper-cased
///
/// Stops at the first character that is not part of a word, whitespace,
/// a comment, or a comma.
fn keywords(sql: &str, limit: usize) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() && words.len() < limit {
        let c = bytes[i];
        if c.is_ascii_whitespace() || c == b',' {
            i += 1;
        } else if c == b'#' || (c == b'-' && bytes.get(i + 1) == Some(&b'-')) {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = match sql[i + 2..].find("*/") {
                Some(end) => i + 2 + end + 2,
                None => bytes.len(),
            };
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            words.push(sql[start..i].to_ascii_uppercase());
        } else {
            break;
        }
    }
    words
}
