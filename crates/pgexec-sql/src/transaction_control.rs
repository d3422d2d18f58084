// SPDX-License-Identifier: Apache-2.0

//! Transaction-control sniffing
//!
//! Decides whether a statement submitted with auto-commit disabled has to be
//! preceded by an implicit `BEGIN`. The rules follow the server grammar:
//! transaction-control statements never get wrapped, and neither do the
//! statements the backend refuses to run inside a transaction block
//! (everything that calls `PreventInTransactionBlock()`).
//!
//! Matching is done on whole leading words, case-insensitively. A word is a
//! run of alphabetic characters, so `beginx` is a different word from
//! `begin` and `begin;` is the word `begin`.

/// Cursor over the leading words of a statement.
struct Words<'a> {
    rest: &'a str,
}

impl<'a> Words<'a> {
    fn new(sql: &'a str) -> Self {
        Self { rest: sql }
    }

    /// Skips leading whitespace and returns the next alphabetic word.
    ///
    /// Returns an empty string when the input does not continue with a letter.
    fn next_word(&mut self) -> &'a str {
        let trimmed = self.rest.trim_start();
        let end = trimmed
            .char_indices()
            .find(|(_, c)| !c.is_alphabetic())
            .map(|(idx, _)| idx)
            .unwrap_or(trimmed.len());
        let (word, rest) = trimmed.split_at(end);
        self.rest = rest;
        word
    }

    /// True when something alphabetic follows the current position.
    fn has_more_words(&self) -> bool {
        self.rest
            .trim_start()
            .chars()
            .next()
            .map(char::is_alphabetic)
            .unwrap_or(false)
    }
}

fn is(word: &str, keyword: &str) -> bool {
    word.len() == keyword.len() && word.eq_ignore_ascii_case(keyword)
}

/// Returns `true` when `sql` may run inside a transaction block opened by an
/// implicit `BEGIN`.
///
/// Returns `false` for transaction-control statements (`ABORT`, `BEGIN`,
/// `START`, `COMMIT`, `END`, `ROLLBACK`, `PREPARE TRANSACTION`) and for the
/// statements PostgreSQL rejects inside a transaction block (`VACUUM`, bare
/// `CLUSTER`, `CREATE DATABASE`, `CREATE TABLESPACE`,
/// `CREATE [UNIQUE] INDEX CONCURRENTLY`, `ALTER SYSTEM`, `DROP DATABASE`,
/// `DROP TABLESPACE`, `REINDEX DATABASE`, `REINDEX SYSTEM`, `DISCARD ALL`).
///
/// Savepoint commands are deliberately not treated as transaction control:
/// they are only valid inside a block, so they need one.
pub fn is_begin_required(sql: &str) -> bool {
    let mut words = Words::new(sql.trim());
    let keyword = words.next_word();

    // `START` can only be `START TRANSACTION`.
    if ["abort", "begin", "start", "commit", "end", "rollback"]
        .iter()
        .any(|kw| is(keyword, kw))
    {
        return false;
    }

    if is(keyword, "prepare") {
        // PREPARE TRANSACTION is transaction control, PREPARE <name> is not.
        return !is(words.next_word(), "transaction");
    }

    if is(keyword, "vacuum") {
        return false;
    }

    if is(keyword, "cluster") {
        // CLUSTER with any arguments is allowed in a transaction block.
        return words.has_more_words();
    }

    if is(keyword, "create") {
        let mut next = words.next_word();
        if is(next, "database") || is(next, "tablespace") {
            return false;
        }
        if is(next, "unique") {
            next = words.next_word();
        }
        if is(next, "index") {
            return !is(words.next_word(), "concurrently");
        }
        return true;
    }

    if is(keyword, "alter") {
        return !is(words.next_word(), "system");
    }

    // These also accept DROP SYSTEM and REINDEX TABLESPACE, neither of which
    // the server will parse, so they need no special treatment.
    if is(keyword, "drop") || is(keyword, "reindex") {
        let next = words.next_word();
        return !(is(next, "database") || is(next, "system") || is(next, "tablespace"));
    }

    if is(keyword, "discard") {
        return !is(words.next_word(), "all");
    }

    true
}
