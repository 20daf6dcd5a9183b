//! Markdown todo outlines: a nom grammar for `- [ ] item` trees and its exact inverse.
//! The core stays pure (text in, tree out, text back); editor and file glue live on top
//! of the `edit`, `schedule` and note helpers or in the `todos` binary.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::{fmt, str::FromStr};

    /* ------------------------------ State ------------------------------ */

    /// Lifecycle of a todo item, as written by its marker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum TodoState {
        Incomplete, // [ ]
        Complete,   // [x]
        Forwarded,  // [>]
        Cancelled,  // x
        /// Plain bullet without checkbox semantics.
        #[default]
        None,
    }

    impl TodoState {
        /// Textual marker, `None` for plain bullets.
        pub const fn marker(self) -> Option<&'static str> {
            match self {
                TodoState::Incomplete => Some("[ ]"),
                TodoState::Complete => Some("[x]"),
                TodoState::Forwarded => Some("[>]"),
                TodoState::Cancelled => Some("x"),
                TodoState::None => None,
            }
        }
    }

    impl fmt::Display for TodoState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                TodoState::Incomplete => "incomplete",
                TodoState::Complete => "complete",
                TodoState::Forwarded => "forwarded",
                TodoState::Cancelled => "cancelled",
                TodoState::None => "plain",
            };
            f.write_str(name)
        }
    }

    /* ------------------------------- Tags ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Tag {
        Focus,
        Urgent,
        Optional,
    }

    impl Tag {
        pub const ALL: [Tag; 3] = [Tag::Focus, Tag::Urgent, Tag::Optional];

        pub const fn as_str(self) -> &'static str {
            match self {
                Tag::Focus => "@focus",
                Tag::Urgent => "@urgent",
                Tag::Optional => "@optional",
            }
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown tag {0:?} (expected focus, urgent or optional)")]
    pub struct UnknownTag(pub String);

    impl FromStr for Tag {
        type Err = UnknownTag;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let name = s.strip_prefix('@').unwrap_or(s);
            Tag::ALL
                .into_iter()
                .find(|tag| &tag.as_str()[1..] == name)
                .ok_or_else(|| UnknownTag(s.to_string()))
        }
    }

    /* ------------------------------- Todo ------------------------------- */

    /// One bullet line plus the items nested under it.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Todo {
        pub state: TodoState,

        /// Free text between the deadline and the tag/comment; trimmed.
        #[serde(default)]
        pub message: String,

        #[serde_as(as = "Option<DisplayFromStr>")]
        pub tag: Option<Tag>,

        /// Text after `//`, trimmed. Doubles as completion time when shaped `HH:MM`.
        #[serde(default)]
        pub comment: Option<String>,

        /// Time of day from a leading `HH:MM |`; the date is implied by the note.
        #[serde(default, with = "serde_hhmm_opt")]
        pub deadline: Option<NaiveTime>,

        /// Nested items in document order.
        #[serde(default)]
        pub children: Vec<Todo>,
    }

    impl Todo {
        pub fn new(state: TodoState, message: impl Into<String>) -> Self {
            Self {
                state,
                message: message.into(),
                ..Self::default()
            }
        }

        pub fn with_deadline(mut self, deadline: NaiveTime) -> Self {
            self.deadline = Some(deadline);
            self
        }

        pub fn with_tag(mut self, tag: Tag) -> Self {
            self.tag = Some(tag);
            self
        }

        pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
            self.comment = Some(comment.into());
            self
        }

        pub fn with_children(mut self, children: Vec<Todo>) -> Self {
            self.children = children;
            self
        }

        /// The comment read as a completion stamp. Derived on every call so it can
        /// never drift from `comment`.
        ///
        /// A comment like `25:00` is just free text here, unlike a `25:00 |` deadline,
        /// which the parser rejects.
        pub fn completion_time(&self) -> Option<NaiveTime> {
            self.comment
                .as_deref()
                .and_then(|c| crate::parser::parse_time_of_day(c).ok())
        }

        /// Resolve the deadline against the date of the note it came from.
        pub fn deadline_on(&self, date: NaiveDate) -> Option<NaiveDateTime> {
            self.deadline.map(|time| date.and_time(time))
        }

        /// Depth-first, pre-order walk over this item and all descendants.
        pub fn walk<'a>(&'a self, out: &mut Vec<&'a Todo>) {
            out.push(self);
            for child in &self.children {
                child.walk(out);
            }
        }
    }

    /// A run of consecutive list lines found inside a larger markdown note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TodoBlock {
        /// Zero-based index of the run's first line in the note.
        pub first_line: usize,
        pub line_count: usize,
        /// Leading spaces shared by the run, stripped before parsing.
        pub indent: usize,
        pub todos: Vec<Todo>,
    }

    /* ----------------------------- Errors ----------------------------- */

    /// Where and why the grammar gave up. Line and column are 1-based; the column
    /// counts bytes.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("line {line}, column {column}: expected {expected}")]
    pub struct ParseError {
        pub offset: usize,
        pub line: usize,
        pub column: usize,
        pub expected: String,
    }

    impl ParseError {
        pub fn at(source: &str, offset: usize, expected: impl Into<String>) -> Self {
            let before = source.get(..offset).unwrap_or(source);
            let line_start = before.rfind('\n').map_or(0, |pos| pos + 1);
            Self {
                offset: before.len(),
                line: before.matches('\n').count() + 1,
                column: before.len() - line_start + 1,
                expected: expected.into(),
            }
        }
    }

    /* ------------------------------ Serde ------------------------------ */

    pub(crate) mod serde_hhmm {
        use chrono::NaiveTime;
        use serde::Serializer;

        pub fn serialize<S>(value: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&value.format("%H:%M").to_string())
        }
    }

    pub(crate) mod serde_hhmm_opt {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S>(value: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(time) => serializer.serialize_some(&time.format("%H:%M").to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt = Option::<String>::deserialize(deserializer)?;
            opt.map(|text| NaiveTime::parse_from_str(&text, "%H:%M").map_err(D::Error::custom))
                .transpose()
        }
    }

}

pub mod parser {
    //! Todo outline parser built on `nom`.
    //!
    //! Each line is `- <state> <HH:MM |> <message> <@tag> <// comment>`, every part but the
    //! bullet optional. Nesting is read from indentation in two-space steps: after an item
    //! we try `newline + indentation`, and when that indentation is deeper than the
    //! current item, the next item becomes its child. Depth is passed down the recursion;
    //! there is no explicit stack.

    use crate::core::*;
    use chrono::NaiveTime;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, take_while_m_n},
        character::complete::{char, line_ending, none_of, not_line_ending, space0, space1},
        combinator::{all_consuming, cut, eof, map, map_res, not, opt, peek, recognize, success, value},
        error::{VerboseError, VerboseErrorKind, context},
        multi::{many0, many1, separated_list1},
        sequence::{preceded, terminated, tuple},
    };

    /// Grammar knobs. The default accepts everything the serializer can emit plus
    /// over-indented children.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParseOptions {
        /// Reject children indented more than one level past their parent instead
        /// of attaching them to it.
        pub strict_indentation: bool,
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parse exactly one item (with its children) spanning all of `input`.
    pub fn parse_todo(input: &str) -> Result<Todo, ParseError> {
        parse_todo_with(input, ParseOptions::default())
    }

    pub fn parse_todo_with(input: &str, opts: ParseOptions) -> Result<Todo, ParseError> {
        let (rest, todo) = todo_item(input, 0, opts).map_err(to_parse_error(input))?;
        expect_end(input, rest)?;
        Ok(todo)
    }

    /// Parse top-level siblings spanning all of `input`. Empty input is an empty forest.
    pub fn parse_forest(input: &str) -> Result<Vec<Todo>, ParseError> {
        parse_forest_with(input, ParseOptions::default())
    }

    pub fn parse_forest_with(input: &str, opts: ParseOptions) -> Result<Vec<Todo>, ParseError> {
        if input.is_empty() {
            return Ok(vec![]);
        }
        let (rest, forest) = forest(input, opts).map_err(to_parse_error(input))?;
        expect_end(input, rest)?;
        Ok(forest)
    }

    /// Parse a bare `HH:MM` clock time.
    pub fn parse_time_of_day(input: &str) -> Result<NaiveTime, ParseError> {
        let (_, time) = all_consuming(time_of_day)(input).map_err(to_parse_error(input))?;
        Ok(time)
    }

    /// Find every run of list lines in a markdown note and parse each one as a forest.
    /// Errors carry note-level positions.
    pub fn parse_note(text: &str, opts: ParseOptions) -> Result<Vec<TodoBlock>, ParseError> {
        let mut offsets = Vec::new();
        let mut offset = 0;
        for piece in text.split_inclusive('\n') {
            offsets.push(offset);
            offset += piece.len();
        }
        let lines: Vec<&str> = text.lines().collect();

        let mut blocks = Vec::new();
        for (first_line, end, indent) in list_runs(&lines) {
            let source = lines[first_line..end]
                .iter()
                .map(|line| &line[indent..])
                .collect::<Vec<_>>()
                .join("\n");
            let todos = parse_forest_with(&source, opts).map_err(|err| {
                tracing::debug!(first_line, %err, "todo block failed to parse");
                let line_idx = first_line + err.line - 1;
                let at = offsets
                    .get(line_idx)
                    .map_or(text.len(), |start| start + indent + err.column - 1);
                ParseError::at(text, at, err.expected)
            })?;
            blocks.push(TodoBlock {
                first_line,
                line_count: end - first_line,
                indent,
                todos,
            });
        }
        Ok(blocks)
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_parse_error(source: &str) -> impl Fn(nom::Err<VerboseError<&str>>) -> ParseError + '_ {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let offset = ve
                    .errors
                    .first()
                    .map_or(0, |(frag, _)| source.len() - frag.len());
                ParseError::at(source, offset, describe(&ve))
            }
            nom::Err::Incomplete(_) => ParseError::at(source, source.len(), "more input"),
        }
    }

    /// Innermost `context` label, else whatever the innermost combinator wanted.
    fn describe(ve: &VerboseError<&str>) -> String {
        let label = ve.errors.iter().find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(label) => Some(label.to_string()),
            _ => None,
        });
        label.unwrap_or_else(|| match ve.errors.first() {
            Some((_, VerboseErrorKind::Char(c))) => format!("{c:?}"),
            Some((_, VerboseErrorKind::Nom(kind))) => kind.description().to_lowercase(),
            _ => "todo item".to_string(),
        })
    }

    fn expect_end(source: &str, rest: &str) -> Result<(), ParseError> {
        if rest.is_empty() {
            return Ok(());
        }
        match line_end_ve(rest) {
            Ok((next, _)) if next.starts_with('-') => Err(ParseError::at(
                source,
                source.len() - next.len(),
                "end of input (single root item)",
            )),
            Ok((next, _)) => Err(ParseError::at(
                source,
                source.len() - next.len(),
                "`-` item indented by a multiple of two spaces",
            )),
            Err(_) => Err(ParseError::at(source, source.len() - rest.len(), "end of line")),
        }
    }

    /* ------------------------------- Utils ------------------------------- */

    fn line_end_ve(i: &str) -> PResult<'_, &str> {
        line_ending(i)
    }

    fn end_of_line(i: &str) -> PResult<'_, &str> {
        alt((line_ending, eof))(i)
    }

    fn indentation(i: &str) -> PResult<'_, &str> {
        recognize(many1(tag("  ")))(i)
    }

    /// A run ends at a shallower line or at one whose indentation is off the
    /// two-space grid of the run's first line; that line starts its own run.
    fn list_runs(lines: &[&str]) -> Vec<(usize, usize, usize)> {
        let mut runs = Vec::new();
        let mut idx = 0;
        while idx < lines.len() {
            if !is_list_line(lines[idx]) {
                idx += 1;
                continue;
            }
            let start = idx;
            let base = indent_width(lines[idx]);
            idx += 1;
            while idx < lines.len() && continues_run(lines[idx], base) {
                idx += 1;
            }
            runs.push((start, idx, base));
        }
        runs
    }

    fn continues_run(line: &str, base: usize) -> bool {
        let width = indent_width(line);
        is_list_line(line) && width >= base && (width - base) % 2 == 0
    }

    fn is_list_line(line: &str) -> bool {
        let body = line.trim_start_matches(' ');
        body == "-" || body.starts_with("- ") || body.starts_with("-\t")
    }

    fn indent_width(line: &str) -> usize {
        line.len() - line.trim_start_matches(' ').len()
    }

    /* ------------------------------ Structure ------------------------------ */

    fn forest<'a>(i: &'a str, opts: ParseOptions) -> PResult<'a, Vec<Todo>> {
        separated_list1(line_end_ve, move |i: &'a str| todo_item(i, 0, opts))(i)
    }

    /// One item at `depth` plus every following line indented deeper than it.
    fn todo_item<'a>(i: &'a str, depth: usize, opts: ParseOptions) -> PResult<'a, Todo> {
        let (i, mut todo) = todo_line(i)?;
        let (i, children) = many0(move |i: &'a str| child_item(i, depth, opts))(i)?;
        todo.children = children;
        Ok((i, todo))
    }

    fn child_item<'a>(i: &'a str, depth: usize, opts: ParseOptions) -> PResult<'a, Todo> {
        let (i, _) = line_end_ve(i)?;
        let (i, indent) = indentation(i)?;
        let child_depth = indent.len() / 2;
        if child_depth <= depth {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("nested item"))],
            }));
        }
        if opts.strict_indentation && child_depth > depth + 1 {
            return Err(nom::Err::Failure(VerboseError {
                errors: vec![(
                    i,
                    VerboseErrorKind::Context("indentation at most one level past the parent"),
                )],
            }));
        }
        todo_item(i, child_depth, opts)
    }

    /* -------------------------------- Line -------------------------------- */

    fn todo_line(i: &str) -> PResult<'_, Todo> {
        let (i, state) = context("todo item", todo_state)(i)?;
        let (i, deadline) = opt(deadline)(i)?;
        let (i, body) = message_text(i)?;
        let (i, comment) = opt(comment)(i)?;
        let (i, _) = context("end of line", peek(end_of_line))(i)?;

        let (message, tag) = split_tag(body.trim());
        let mut todo = Todo::new(state, message);
        todo.tag = tag;
        todo.comment = comment;
        todo.deadline = deadline;
        Ok((i, todo))
    }

    fn todo_state(i: &str) -> PResult<'_, TodoState> {
        preceded(
            char('-'),
            alt((
                preceded(
                    space1,
                    alt((terminated(state_marker, marker_end), success(TodoState::None))),
                ),
                value(TodoState::None, peek(end_of_line)),
            )),
        )(i)
    }

    /// Bracketed forms come first so a bare `x` never eats into them.
    fn state_marker(i: &str) -> PResult<'_, TodoState> {
        alt((
            value(TodoState::Incomplete, tag("[ ]")),
            value(TodoState::Complete, tag("[x]")),
            value(TodoState::Forwarded, tag("[>]")),
            value(TodoState::Cancelled, tag("x")),
        ))(i)
    }

    fn marker_end(i: &str) -> PResult<'_, ()> {
        alt((value((), space1), value((), peek(end_of_line))))(i)
    }

    fn time_shape(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
            char(':'),
            take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
        )))(i)
    }

    fn time_of_day(i: &str) -> PResult<'_, NaiveTime> {
        map_res(time_shape, |s: &str| NaiveTime::parse_from_str(s, "%H:%M"))(i)
    }

    /// `HH:MM |`. Once the shape matches, an impossible clock time is fatal.
    fn deadline(i: &str) -> PResult<'_, NaiveTime> {
        preceded(
            peek(tuple((time_shape, space0, char('|')))),
            terminated(
                cut(context("deadline time (HH:MM)", time_of_day)),
                tuple((space0, char('|'), space0)),
            ),
        )(i)
    }

    fn message_text(i: &str) -> PResult<'_, &str> {
        recognize(many0(alt((link, message_char))))(i)
    }

    /// `[label](http...)`, consumed whole so the `//` of its URL is not a comment.
    fn link(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            char('['),
            opt(is_not("]\r\n")),
            char(']'),
            char('('),
            tag("http"),
            is_not(")\r\n"),
            char(')'),
        )))(i)
    }

    fn message_char(i: &str) -> PResult<'_, &str> {
        recognize(preceded(not(tag("//")), none_of("\r\n")))(i)
    }

    fn comment(i: &str) -> PResult<'_, String> {
        map(preceded(tag("//"), not_line_ending), |s: &str| s.trim().to_string())(i)
    }

    /// The tag is the last whitespace-separated token of the message.
    fn split_tag(body: &str) -> (String, Option<Tag>) {
        for tag in Tag::ALL {
            if let Some(head) = body.strip_suffix(tag.as_str()) {
                if head.is_empty() || head.ends_with(char::is_whitespace) {
                    return (head.trim_end().to_string(), Some(tag));
                }
            }
        }
        (body.to_string(), None)
    }

}

pub mod format {
    //! Canonical text for todo trees; the exact inverse of `parser` on its own output.

    use super::core::*;
    use crate::parser::{ParseOptions, parse_note};
    use chrono::NaiveTime;

    pub fn format_todo(todo: &Todo) -> String {
        let mut out = String::new();
        format_at(&mut out, todo, 0);
        out
    }

    pub fn format_forest(forest: &[Todo]) -> String {
        let mut out = String::new();
        for (idx, todo) in forest.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            format_at(&mut out, todo, 0);
        }
        out
    }

    pub fn format_hhmm(time: NaiveTime) -> String {
        time.format("%H:%M").to_string()
    }

    /// Rewrite every todo block of a note canonically, leaving other lines alone.
    ///
    /// A bullet is only rewritten when canonical form changes nothing but its
    /// spacing between words; `- see https://example.com` keeps its URL intact.
    /// Each line keeps its own line ending.
    pub fn format_note(text: &str, opts: ParseOptions) -> Result<String, ParseError> {
        let blocks = parse_note(text, opts)?;
        let mut lines: Vec<(String, &str)> = text
            .split_inclusive('\n')
            .map(|piece| {
                let body = piece
                    .strip_suffix('\n')
                    .map(|b| b.strip_suffix('\r').unwrap_or(b))
                    .unwrap_or(piece);
                (body.to_string(), &piece[body.len()..])
            })
            .collect();

        for block in &blocks {
            let pad = " ".repeat(block.indent);
            let span = block.first_line..block.first_line + block.line_count;
            for ((body, _), line) in lines[span].iter_mut().zip(format_forest(&block.todos).lines()) {
                let canonical = format!("{pad}{line}");
                if same_words(body, &canonical) {
                    *body = canonical;
                } else {
                    tracing::debug!(line = %body, "keeping bullet whose words would change");
                }
            }
        }

        Ok(lines
            .iter()
            .map(|(body, ending)| format!("{body}{ending}"))
            .collect())
    }

    fn same_words(a: &str, b: &str) -> bool {
        a.split_whitespace().eq(b.split_whitespace())
    }

    fn format_at(out: &mut String, todo: &Todo, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&render_line(todo));
        for child in &todo.children {
            out.push('\n');
            format_at(out, child, depth + 1);
        }
    }

    /// Fields in fixed order; empty slots would leave stray spaces, hence the trim.
    fn render_line(todo: &Todo) -> String {
        let mut buf = String::from("-");
        if let Some(marker) = todo.state.marker() {
            buf.push(' ');
            buf.push_str(marker);
        }
        buf.push(' ');
        if let Some(deadline) = todo.deadline {
            buf.push_str(&format_hhmm(deadline));
            buf.push_str(" | ");
        }
        buf.push_str(&todo.message);
        if let Some(tag) = todo.tag {
            buf.push(' ');
            buf.push_str(tag.as_str());
        }
        buf.push(' ');
        if let Some(comment) = &todo.comment {
            buf.push_str("// ");
            buf.push_str(comment);
        }
        buf.trim().to_string()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{parse_forest, parse_todo};

        #[test]
        fn minimal_lines() {
            let cases = [
                (TodoState::Incomplete, "A todo message", "- [ ] A todo message"),
                (TodoState::Complete, "A completed todo", "- [x] A completed todo"),
                (TodoState::Forwarded, "A forwarded todo", "- [>] A forwarded todo"),
                (TodoState::Cancelled, "A cancelled todo", "- x A cancelled todo"),
                (TodoState::None, "A simple line item", "- A simple line item"),
            ];
            for (state, message, expected) in cases {
                assert_eq!(format_todo(&Todo::new(state, message)), expected);
            }
        }

        #[test]
        fn every_optional_field() {
            let todo = Todo::new(TodoState::Incomplete, "Ship it")
                .with_deadline(NaiveTime::from_hms_opt(15, 0, 0).unwrap())
                .with_tag(Tag::Focus)
                .with_comment("after review");
            assert_eq!(
                format_todo(&todo),
                "- [ ] 15:00 | Ship it @focus // after review"
            );
        }

        #[test]
        fn children_are_indented_per_level() {
            let todo = Todo::new(TodoState::Incomplete, "Parent").with_children(vec![
                Todo::new(TodoState::None, "Child")
                    .with_children(vec![Todo::new(TodoState::Complete, "Grandchild")]),
                Todo::new(TodoState::None, "Sibling"),
            ]);
            assert_eq!(
                format_todo(&todo),
                "- [ ] Parent\n  - Child\n    - [x] Grandchild\n  - Sibling"
            );
        }

        #[test]
        fn parse_then_format_is_identity() {
            let sources = [
                "- [ ] A plain todo",
                "- [x] A checked todo",
                "- [>] A forwarded todo",
                "- x A cancelled todo",
                "- [ ] 15:00 | This one has a due date",
                "- [x] This one has been completed // 15:15",
                "- [>] This one has been forwarded at a particular time // 15:15",
                "- x This one has been cancelled with a comment // Why it was cancelled",
                "- This is a simple line item",
                "- [ ] 08:30 | Standup @urgent // room 4",
                "- [ ] Read [spec](https://example.com/x) @optional",
                "- [ ]  @focus",
                "- [ ] 11:00 |",
                "- [ ]  //",
                "-",
                "- [ ] Level 1\n  - [x] Level 2\n    - [>] Level 3\n      - x Level 4\n        - Level 5",
                "- [ ] Two\n  - [ ] One\n    - note\n  - [ ] Other\n    - note",
            ];
            for source in sources {
                let todo = parse_todo(source).expect(source);
                assert_eq!(format_todo(&todo), source);
            }
        }

        #[test]
        fn every_field_combination_round_trips() {
            let states = [
                TodoState::Incomplete,
                TodoState::Complete,
                TodoState::Forwarded,
                TodoState::Cancelled,
                TodoState::None,
            ];
            let deadlines = [None, NaiveTime::from_hms_opt(7, 5, 0)];
            let messages = ["", "Pay rent"];
            let tags = [None, Some(Tag::Focus), Some(Tag::Urgent), Some(Tag::Optional)];
            let comments = [None, Some("call back first"), Some("11:05")];
            let children = [
                vec![],
                vec![Todo::new(TodoState::Complete, "sub").with_comment("09:00")],
            ];

            let mut checked = 0;
            for state in states {
                for deadline in deadlines {
                    for message in messages {
                        for tag in tags {
                            for comment in comments {
                                for kids in &children {
                                    let mut todo = Todo::new(state, message).with_children(kids.clone());
                                    todo.deadline = deadline;
                                    todo.tag = tag;
                                    todo.comment = comment.map(str::to_string);

                                    let text = format_todo(&todo);
                                    let parsed = parse_todo(&text).expect(&text);
                                    assert_eq!(parsed, todo, "{text}");
                                    assert_eq!(format_todo(&parsed), text);
                                    checked += 1;
                                }
                            }
                        }
                    }
                }
            }
            assert_eq!(checked, 5 * 2 * 2 * 4 * 3 * 2);
        }

        #[test]
        fn forest_round_trips() {
            let source = "- [ ] One\n  - a\n- [x] Two // 09:10\n- Three";
            assert_eq!(format_forest(&parse_forest(source).unwrap()), source);
        }

        #[test]
        fn over_indentation_is_normalized() {
            let todo = parse_todo("- a\n      - b").unwrap();
            assert_eq!(format_todo(&todo), "- a\n  - b");
        }

        #[test]
        fn note_formatting_only_touches_todo_blocks() {
            let note = "# 2024-03-01\n\n## TODO\n- [ ]   Plan   \n  - outline\n\nSome prose.\n  - [x]  done //  09:00\n";
            let expected = "# 2024-03-01\n\n## TODO\n- [ ] Plan\n  - outline\n\nSome prose.\n  - [x] done // 09:00\n";
            let formatted = format_note(note, ParseOptions::default()).unwrap();
            assert_eq!(formatted, expected);
            assert_eq!(format_note(&formatted, ParseOptions::default()).unwrap(), formatted);
        }

        #[test]
        fn note_formatting_leaves_bare_urls_alone() {
            let note = "## Links\n- see https://example.com/page\n-  [ ]  tidy  \n";
            let formatted = format_note(note, ParseOptions::default()).unwrap();
            assert_eq!(formatted, "## Links\n- see https://example.com/page\n- [ ] tidy\n");
        }

        #[test]
        fn note_formatting_keeps_crlf_endings() {
            let note = "# Day\r\n- [ ]  a\r\nprose\r\n";
            let formatted = format_note(note, ParseOptions::default()).unwrap();
            assert_eq!(formatted, "# Day\r\n- [ ] a\r\nprose\r\n");
        }
    }
}

pub mod edit {
    //! Single-line edits for editor commands. Each edit parses the line with the grammar,
    //! changes the tree and serializes it back, keeping the line's indentation.

    use crate::core::*;
    use crate::format::{format_hhmm, format_todo};
    use crate::parser::parse_todo;
    use chrono::{NaiveDate, NaiveTime};

    /// Heading under which new and carried todos are inserted.
    pub const TODO_HEADING: &str = "## TODO";

    #[derive(Debug, thiserror::Error)]
    pub enum EditError {
        #[error(transparent)]
        Parse(#[from] ParseError),
        #[error("expected a single line")]
        MultiLine,
        #[error("cannot {action} a {state} item")]
        Unsupported {
            action: &'static str,
            state: TodoState,
        },
    }

    /// Result of forwarding: the rewritten source line and the line to carry over.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Forwarded {
        pub line: String,
        pub carried: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Unforwarded {
        pub line: String,
        /// Date of the `[[YYYY-MM-DD]]` link that was removed, if any.
        pub target: Option<NaiveDate>,
    }

    /// Check an open todo or reopen a checked one.
    ///
    /// Checking drops the tag and, given `completed_at`, records it as the comment.
    /// Reopening drops the comment only when it is a completion time.
    pub fn toggle_todo(line: &str, completed_at: Option<NaiveTime>) -> Result<String, EditError> {
        rewrite(line, |todo| match todo.state {
            TodoState::Incomplete => {
                todo.state = TodoState::Complete;
                todo.tag = None;
                if let Some(at) = completed_at {
                    todo.comment = Some(format_hhmm(at));
                }
                Ok(())
            }
            TodoState::Complete => {
                todo.state = TodoState::Incomplete;
                if todo.completion_time().is_some() {
                    todo.comment = None;
                }
                Ok(())
            }
            state => Err(EditError::Unsupported {
                action: "toggle",
                state,
            }),
        })
    }

    /// Same tag removes it, another tag replaces it, no tag adds it.
    pub fn toggle_tag(line: &str, tag: Tag) -> Result<String, EditError> {
        rewrite(line, |todo| {
            todo.tag = if todo.tag == Some(tag) { None } else { Some(tag) };
            Ok(())
        })
    }

    pub fn forward_todo(line: &str, to: Option<NaiveDate>) -> Result<Forwarded, EditError> {
        let (indent, mut todo) = parse_line(line)?;
        if todo.state != TodoState::Incomplete {
            return Err(EditError::Unsupported {
                action: "forward",
                state: todo.state,
            });
        }
        let carried = format_todo(&todo);

        todo.state = TodoState::Forwarded;
        if let Some(date) = to {
            let link = date_link(date);
            todo.message = if todo.message.is_empty() {
                link
            } else {
                format!("{} {link}", todo.message)
            };
        }
        tracing::debug!(%carried, ?to, "forwarded todo");
        Ok(Forwarded {
            line: format!("{indent}{}", format_todo(&todo)),
            carried,
        })
    }

    pub fn unforward_todo(line: &str) -> Result<Unforwarded, EditError> {
        let (indent, mut todo) = parse_line(line)?;
        if todo.state != TodoState::Forwarded {
            return Err(EditError::Unsupported {
                action: "unforward",
                state: todo.state,
            });
        }
        let (message, target) = strip_date_link(&todo.message);
        todo.message = message.to_string();
        todo.state = TodoState::Incomplete;
        Ok(Unforwarded {
            line: format!("{indent}{}", format_todo(&todo)),
            target,
        })
    }

    /// `[[YYYY-MM-DD]]`, the wikilink of a daily note.
    pub fn date_link(date: NaiveDate) -> String {
        format!("[[{}]]", date.format("%Y-%m-%d"))
    }

    /// Insert `line` directly below the note's `## TODO` heading.
    pub fn add_to_todo_section(note: &str, line: &str) -> Option<String> {
        let mut lines: Vec<&str> = note.lines().collect();
        let heading = lines.iter().position(|l| l.trim_end() == TODO_HEADING)?;
        lines.insert(heading + 1, line);
        Some(rejoin(note, &lines))
    }

    /// Remove the first line equal to `line`.
    pub fn remove_line(note: &str, line: &str) -> Option<String> {
        let mut lines: Vec<&str> = note.lines().collect();
        let idx = lines.iter().position(|l| *l == line)?;
        lines.remove(idx);
        Some(rejoin(note, &lines))
    }

    fn rejoin(original: &str, lines: &[&str]) -> String {
        let mut out = lines.join("\n");
        if original.ends_with('\n') || original.is_empty() {
            out.push('\n');
        }
        out
    }

    fn parse_line(line: &str) -> Result<(&str, Todo), EditError> {
        if line.contains('\n') {
            return Err(EditError::MultiLine);
        }
        let body = line.trim_start_matches(' ');
        let indent = &line[..line.len() - body.len()];
        Ok((indent, parse_todo(body.trim_end())?))
    }

    fn rewrite(
        line: &str,
        edit: impl FnOnce(&mut Todo) -> Result<(), EditError>,
    ) -> Result<String, EditError> {
        let (indent, mut todo) = parse_line(line)?;
        edit(&mut todo)?;
        let out = format!("{indent}{}", format_todo(&todo));
        tracing::trace!(before = line, after = %out, "rewrote todo line");
        Ok(out)
    }

    fn strip_date_link(message: &str) -> (&str, Option<NaiveDate>) {
        if let Some(head) = message.strip_suffix("]]") {
            if let Some(pos) = head.rfind("[[") {
                if let Ok(date) = NaiveDate::parse_from_str(&head[pos + 2..], "%Y-%m-%d") {
                    return (head[..pos].trim_end(), Some(date));
                }
            }
        }
        (message, None)
    }

}

pub mod schedule {
    //! Deadlines of open todos, for reminder glue. Delivery is someone else's job.

    use crate::core::{TodoState, serde_hhmm};
    use crate::parser::parse_todo;
    use chrono::{Duration, NaiveTime};
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ScheduledItem {
        /// One-based line number in the note.
        pub line: usize,
        #[serde(serialize_with = "serde_hhmm::serialize")]
        pub deadline: NaiveTime,
        pub message: String,
    }

    /// Every open todo with a deadline, earliest first. Lines that are not todos are skipped.
    pub fn extract_scheduled(text: &str) -> Vec<ScheduledItem> {
        let mut items: Vec<ScheduledItem> = text
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let body = raw.trim();
                if !body.starts_with('-') {
                    return None;
                }
                match parse_todo(body) {
                    Ok(todo) if todo.state == TodoState::Incomplete => {
                        todo.deadline.map(|deadline| ScheduledItem {
                            line: idx + 1,
                            deadline,
                            message: todo.message,
                        })
                    }
                    Ok(_) => None,
                    Err(err) => {
                        tracing::trace!(line = idx + 1, %err, "skipping non-todo line");
                        None
                    }
                }
            })
            .collect();
        items.sort_by_key(|item| item.deadline);
        items
    }

    /// Items due between `now` and `now + lead`, inclusive.
    pub fn upcoming(
        items: &[ScheduledItem],
        now: NaiveTime,
        lead: Duration,
    ) -> impl Iterator<Item = &ScheduledItem> {
        items
            .iter()
            .filter(move |item| item.deadline >= now && item.deadline - now <= lead)
    }

}

pub use crate::core::{ParseError, Tag, Todo, TodoBlock, TodoState};
pub use format::{format_forest, format_note, format_todo};
pub use parser::{ParseOptions, parse_forest, parse_note, parse_todo};
