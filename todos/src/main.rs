use std::{
    collections::{BTreeSet, HashSet},
    fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate, NaiveTime, Timelike};
use clap::{Args, Parser, Subcommand};
use todos::core::{Tag, TodoBlock};
use todos::edit::{self, Forwarded, Unforwarded};
use todos::parser::{ParseOptions, parse_time_of_day};
use todos::schedule::{self, ScheduledItem};
use todos::{format_note, parse_note};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todos",
    about = "Parse, format and edit markdown todo outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Reject children indented more than one level past their parent.
    #[arg(long, global = true)]
    strict: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse the todo blocks of notes and print them.
    Parse(ParseArgs),

    /// Rewrite todo blocks canonically, leaving other lines untouched.
    Format(FormatArgs),

    /// Fail if any note has todo blocks that are not in canonical form.
    Check(CheckArgs),

    /// List open todos with a deadline, optionally only those due soon.
    Schedule(ScheduleArgs),

    /// Edit a single todo line and print the result.
    #[command(subcommand)]
    Edit(EditCommands),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files, directories containing them, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Markdown files, directories containing them, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Markdown files, directories containing them, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    /// Daily note to scan, or `-` for stdin.
    input: PathBuf,
    /// Reference time (HH:MM). Defaults to the local clock.
    #[arg(long, value_parser = parse_clock)]
    now: Option<NaiveTime>,
    /// Only list deadlines at most this many minutes after `--now`.
    #[arg(long)]
    within: Option<i64>,
    /// Emit JSON instead of one line per deadline.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum EditCommands {
    /// Check an open todo or reopen a checked one.
    Toggle {
        /// The todo line, e.g. "- [ ] Call Sam".
        #[arg(allow_hyphen_values = true)]
        line: String,
        /// Completion time to record (HH:MM).
        #[arg(long, value_parser = parse_clock, conflicts_with = "stamp")]
        at: Option<NaiveTime>,
        /// Record the current local time as completion time.
        #[arg(long)]
        stamp: bool,
    },

    /// Add, replace or remove the tag of a todo.
    Tag {
        #[arg(allow_hyphen_values = true)]
        line: String,
        /// focus, urgent or optional (the leading `@` is optional).
        tag: Tag,
    },

    /// Mark an open todo as forwarded and print the line to carry over.
    Forward {
        #[arg(allow_hyphen_values = true)]
        line: String,
        /// Date of the note the todo moves to (YYYY-MM-DD).
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Insert the carried todo under `## TODO` in this note.
        #[arg(long)]
        into: Option<PathBuf>,
    },

    /// Reopen a forwarded todo.
    Unforward {
        #[arg(allow_hyphen_values = true)]
        line: String,
        /// Remove the carried todo from this note.
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let opts = ParseOptions {
        strict_indentation: cli.strict,
    };
    match cli.command {
        Commands::Parse(args) => handle_parse(args, opts),
        Commands::Format(args) => handle_format(args, opts),
        Commands::Check(args) => handle_check(args, opts),
        Commands::Schedule(args) => handle_schedule(args),
        Commands::Edit(cmd) => handle_edit(cmd),
    }
}

/// `TODOS_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let filter = std::env::var("TODOS_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(if verbose { "todos=debug" } else { "todos=warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_clock(raw: &str) -> Result<NaiveTime, String> {
    parse_time_of_day(raw).map_err(|e| format!("{raw:?} is not a HH:MM time ({e})"))
}

/* ------------------------------- Sources ------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Stdin,
    File(PathBuf),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Stdin => f.write_str("<stdin>"),
            Source::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn read_source(source: &Source) -> Result<String> {
    match source {
        Source::Stdin => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
        Source::File(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
        }
    }
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<Source>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        if path.as_os_str() == "-" {
            if visited.insert(Source::Stdin) {
                out.push(Source::Stdin);
            }
            continue;
        }
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            tracing::debug!(dir = ?canonical, "scanning directory");
            for file in collect_markdown_files(&canonical)? {
                let source = Source::File(file);
                if visited.insert(source.clone()) {
                    out.push(source);
                }
            }
        } else if meta.is_file() {
            if !is_markdown(&canonical) {
                anyhow::bail!("{:?} is not a .md file", canonical);
            }
            tracing::debug!(file = ?canonical, "adding file");
            let source = Source::File(canonical);
            if visited.insert(source.clone()) {
                out.push(source);
            }
        }
    }
    Ok(out)
}

fn collect_markdown_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(root, &mut out, &mut visited)?;
    out.sort();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        tracing::trace!(file = ?canonical, "found markdown file");
        out.push(canonical);
    }
    Ok(())
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

fn expand_nonempty(paths: &[PathBuf]) -> Result<Vec<Source>> {
    let expanded = expand_inputs(paths)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }
    Ok(expanded)
}

/* ------------------------------- Commands ------------------------------- */

fn handle_parse(args: ParseArgs, opts: ParseOptions) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let mut parsed = Vec::new();
    for source in expand_nonempty(&inputs)? {
        tracing::debug!(%source, "parsing");
        let text = read_source(&source)?;
        let blocks = parse_note(&text, opts).with_context(|| format!("parsing {source}"))?;
        parsed.push((source, blocks));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            blocks: &'a [TodoBlock],
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(source, blocks)| JsonOutput {
                path: source.to_string(),
                blocks,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (source, blocks)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {source} ({} items) ==", count_items(blocks));
            }
            println!("{:#?}", blocks);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn count_items(blocks: &[TodoBlock]) -> usize {
    let mut all = Vec::new();
    for todo in blocks.iter().flat_map(|b| &b.todos) {
        todo.walk(&mut all);
    }
    all.len()
}

fn handle_format(args: FormatArgs, opts: ParseOptions) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_nonempty(&inputs)?;
    let mut first = true;

    for source in expanded {
        tracing::debug!(%source, "formatting");
        let text = read_source(&source)?;
        let formatted = format_note(&text, opts).with_context(|| format!("parsing {source}"))?;

        if in_place {
            let Source::File(path) = &source else {
                anyhow::bail!("--in-place cannot write back to stdin");
            };
            if formatted != text {
                fs::write(path, formatted.as_bytes())
                    .with_context(|| format!("writing {:?}", path))?;
            }
        } else {
            if !first {
                println!();
                println!("== {source} ==");
            } else if inputs.len() > 1 {
                println!("== {source} ==");
            }
            first = false;
            print!("{formatted}");
            if !formatted.ends_with('\n') {
                println!();
            }
        }
    }

    Ok(())
}

/// Whether formatting would leave `text` unchanged.
fn is_canonical(text: &str, opts: ParseOptions) -> Result<bool> {
    Ok(format_note(text, opts)? == text)
}

fn handle_check(args: CheckArgs, opts: ParseOptions) -> Result<()> {
    let mut dirty = 0;
    for source in expand_nonempty(&args.inputs)? {
        let text = read_source(&source)?;
        if !is_canonical(&text, opts).with_context(|| format!("parsing {source}"))? {
            println!("{source}: not formatted");
            dirty += 1;
        }
    }
    if dirty > 0 {
        anyhow::bail!("{dirty} note(s) need formatting");
    }
    Ok(())
}

fn handle_schedule(args: ScheduleArgs) -> Result<()> {
    let ScheduleArgs {
        input,
        now,
        within,
        json,
    } = args;
    let source = match expand_nonempty(std::slice::from_ref(&input))?.as_slice() {
        [single] => single.clone(),
        _ => anyhow::bail!("schedule expects a single note, got {:?}", input),
    };
    let text = read_source(&source)?;
    let items = schedule::extract_scheduled(&text);

    let selected: Vec<&ScheduledItem> = match within {
        Some(minutes) => {
            let now = now.unwrap_or_else(local_minute);
            schedule::upcoming(&items, now, Duration::minutes(minutes)).collect()
        }
        None => items.iter().collect(),
    };
    tracing::debug!(total = items.len(), selected = selected.len(), "scheduled todos");

    if json {
        println!("{}", serde_json::to_string_pretty(&selected)?);
    } else {
        for item in selected {
            println!(
                "{}  {} (line {})",
                todos::format::format_hhmm(item.deadline),
                item.message,
                item.line
            );
        }
    }
    Ok(())
}

fn local_minute() -> NaiveTime {
    let now = Local::now().time();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now)
}

fn handle_edit(cmd: EditCommands) -> Result<()> {
    match cmd {
        EditCommands::Toggle { line, at, stamp } => {
            let at = if stamp { Some(local_minute()) } else { at };
            println!("{}", edit::toggle_todo(&line, at)?);
        }
        EditCommands::Tag { line, tag } => {
            println!("{}", edit::toggle_tag(&line, tag)?);
        }
        EditCommands::Forward { line, to, into } => {
            let Forwarded { line, carried } = edit::forward_todo(&line, to)?;
            if let Some(note) = into {
                update_note(&note, |text| edit::add_to_todo_section(text, &carried), "no `## TODO` heading")?;
            }
            println!("{line}");
            println!("{carried}");
        }
        EditCommands::Unforward { line, from } => {
            let Unforwarded { line: reopened, target } = edit::unforward_todo(&line)?;
            if let Some(note) = from {
                let carried = reopened.trim_start();
                update_note(&note, |text| edit::remove_line(text, carried), "carried todo not found")?;
            }
            if let Some(date) = target {
                tracing::debug!(%date, "removed forward link");
            }
            println!("{reopened}");
        }
    }
    Ok(())
}

fn update_note(
    path: &Path,
    change: impl FnOnce(&str) -> Option<String>,
    missing: &str,
) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let Some(updated) = change(&text) else {
        anyhow::bail!("{:?}: {missing}", path);
    };
    fs::write(path, updated.as_bytes()).with_context(|| format!("writing {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_walks_directories_for_markdown() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("2024").join("03");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("a.md"), "- [ ] a").expect("write a");
        fs::write(nested.join("b.md"), "- [ ] b").expect("write b");
        fs::write(root.join("notes.txt"), "- [ ] skipped").expect("write txt");

        let expanded = expand_inputs(&[root.to_path_buf()]).expect("expand");
        let canonical = fs::canonicalize(root).expect("canonical root");
        assert_eq!(
            expanded,
            vec![
                Source::File(canonical.join("2024").join("03").join("b.md")),
                Source::File(canonical.join("a.md")),
            ]
        );
    }

    #[test]
    fn expand_inputs_dedupes_and_accepts_stdin() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("day.md");
        fs::write(&file, "- x").expect("write");

        let expanded = expand_inputs(&[
            file.clone(),
            PathBuf::from("-"),
            tmp.path().to_path_buf(),
            PathBuf::from("-"),
        ])
        .expect("expand");
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[1], Source::Stdin);
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("todo.org");
        fs::write(&file, "* TODO").expect("write");
        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn canonical_check() {
        let opts = ParseOptions::default();
        assert!(is_canonical("# Day\n- [ ] ok\n", opts).expect("parse"));
        assert!(!is_canonical("# Day\n- [ ]  spaced \n", opts).expect("parse"));
        assert!(is_canonical("- [ ] 99:00 | bad", opts).is_err());
    }

    #[test]
    fn clock_values() {
        assert_eq!(parse_clock("08:15"), Ok(NaiveTime::from_hms_opt(8, 15, 0).unwrap()));
        assert!(parse_clock("8:15").is_err());
    }

    #[test]
    fn cli_parses_edit_subcommands() {
        let cli = Cli::try_parse_from(["todos", "--strict", "edit", "tag", "- [ ] a", "@focus"])
            .expect("cli");
        assert!(cli.strict);
        assert!(matches!(
            cli.command,
            Commands::Edit(EditCommands::Tag { tag: Tag::Focus, .. })
        ));

        let cli = Cli::try_parse_from(["todos", "edit", "toggle", "- [ ] a", "--at", "10:30"])
            .expect("cli");
        assert!(matches!(
            cli.command,
            Commands::Edit(EditCommands::Toggle { at: Some(_), stamp: false, .. })
        ));

        let cli = Cli::try_parse_from([
            "todos",
            "edit",
            "forward",
            "  - [ ] Renew passport",
            "--to",
            "2024-03-02",
        ])
        .expect("cli");
        match cli.command {
            Commands::Edit(EditCommands::Forward { line, to, into }) => {
                assert_eq!(line, "  - [ ] Renew passport");
                assert_eq!(to, NaiveDate::from_ymd_opt(2024, 3, 2));
                assert!(into.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn forwarding_round_trip_through_notes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("2024-03-02.md");
        let original = "# 2024-03-02\n\n## TODO\n- [ ] existing\n";
        fs::write(&note, original).expect("write note");

        let fwd = edit::forward_todo("- [ ] Call Sam", None).expect("forward");
        update_note(
            &note,
            |text| edit::add_to_todo_section(text, &fwd.carried),
            "missing",
        )
        .expect("add");
        assert_eq!(
            fs::read_to_string(&note).expect("read"),
            "# 2024-03-02\n\n## TODO\n- [ ] Call Sam\n- [ ] existing\n"
        );

        update_note(&note, |text| edit::remove_line(text, "- [ ] Call Sam"), "missing")
            .expect("remove");
        assert_eq!(fs::read_to_string(&note).expect("read"), original);

        let err = update_note(&note, |text| edit::remove_line(text, "- [ ] gone"), "missing");
        assert!(err.is_err());
    }
}
