//! Validation of user-supplied encoder option strings.
//!
//! Profiles may carry free-form input/output/filter options that end up on
//! the encoder's command line. They are tokenized here, never handed to a
//! shell, and rejected outright when they smell like an escape attempt.

use crate::{Error, Result};

/// Which option slot a string is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
	Input,
	Output,
	FilterComplex,
}

/// Flags that could subvert the sandboxing of the encoder invocation.
const DENIED_FLAGS: &[&str] = &[
	"-i",
	"-y",
	"-n",
	"-protocol_whitelist",
	"-protocol_blacklist",
	"-safe",
	"-dump",
	"-hex",
];

/// Flags the profile already controls; allowed but pointless.
const REDUNDANT_FLAGS: &[&str] = &["-f", "-c:v", "-c:a", "-threads", "-re"];

/// Filters that read from the filesystem or open sockets.
const FILE_READING_FILTERS: &[&str] = &["movie=", "amovie=", "sendcmd=", "zmq="];

/// Validate one option string and split it into argv tokens.
///
/// Quotes group tokens and are stripped; nothing else shell-like is
/// honored, and anything shell-like is grounds for rejection.
pub fn validate_options(kind: OptionKind, raw: &str) -> Result<Vec<String>> {
	reject_shell_syntax(raw)?;

	let tokens = tokenize(raw)?;

	for token in &tokens {
		let flag = token.split('=').next().unwrap_or(token);

		if DENIED_FLAGS.contains(&flag) || flag.starts_with("-filter_script") {
			return Err(Error::Validation(format!("flag {token:?} is not allowed")));
		}

		if REDUNDANT_FLAGS.contains(&flag) {
			tracing::warn!(option = %token, "option duplicates a profile setting");
		}

		if kind == OptionKind::FilterComplex {
			for filter in FILE_READING_FILTERS {
				if token.contains(filter) {
					tracing::warn!(option = %token, filter, "filter reads external resources");
				}
			}
		}
	}

	Ok(tokens)
}

fn reject_shell_syntax(raw: &str) -> Result<()> {
	if raw.contains("$(") || raw.contains('`') {
		return Err(Error::Validation("command substitution is not allowed".into()));
	}
	if raw.contains("${") {
		return Err(Error::Validation("variable expansion is not allowed".into()));
	}
	// Any $-prefixed word counts as expansion.
	let mut prev = ' ';
	for c in raw.chars() {
		if prev == '$' && (c.is_alphanumeric() || c == '_') {
			return Err(Error::Validation("variable expansion is not allowed".into()));
		}
		prev = c;
	}

	if raw.contains(';') || raw.contains("&&") {
		return Err(Error::Validation("command separators are not allowed".into()));
	}
	// A single pipe is a separator; "||" appears in filter expressions.
	let bytes = raw.as_bytes();
	for (i, &b) in bytes.iter().enumerate() {
		if b == b'|' {
			let doubled = (i > 0 && bytes[i - 1] == b'|') || bytes.get(i + 1) == Some(&b'|');
			if !doubled {
				return Err(Error::Validation("pipes are not allowed".into()));
			}
		}
	}

	if raw.contains('>') || raw.contains('<') {
		return Err(Error::Validation("redirections are not allowed".into()));
	}

	for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
		let opens = raw.chars().filter(|&c| c == open).count();
		let closes = raw.chars().filter(|&c| c == close).count();
		if opens != closes {
			return Err(Error::Validation(format!("unbalanced {open}{close} brackets")));
		}
	}

	Ok(())
}

/// Whitespace split with single- and double-quote grouping.
fn tokenize(raw: &str) -> Result<Vec<String>> {
	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut quote: Option<char> = None;

	for c in raw.chars() {
		match (quote, c) {
			(Some(q), _) if c == q => quote = None,
			(Some(_), _) => current.push(c),
			(None, '\'' | '"') => quote = Some(c),
			(None, c) if c.is_whitespace() => {
				if !current.is_empty() {
					tokens.push(std::mem::take(&mut current));
				}
			}
			(None, _) => current.push(c),
		}
	}

	if quote.is_some() {
		return Err(Error::Validation("unbalanced quotes".into()));
	}
	if !current.is_empty() {
		tokens.push(current);
	}
	Ok(tokens)
}
