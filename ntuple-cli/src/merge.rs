use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use clap::ArgGroup;
use humansize::{BINARY, format_size};
use ntuple::{ConcatOptions, ConcatSummary, Concatenator, DEFAULT_MEMORY_BYTES, NtupleResult};
use ntuple_store::comm::ThreadGroup;
use ntuple_store::{Container, CreateMode};
use regex::Regex;

use crate::size::parse_size;

#[derive(Debug, clap::Args)]
#[command(group(ArgGroup::new("mode").args(["append", "truncate", "exclusive"])))]
pub struct MergeArgs {
    /// Append to the output if it exists.
    #[arg(short, long)]
    append: bool,

    /// Replace the output if it exists.
    #[arg(short, long)]
    truncate: bool,

    /// Fail if the output exists. This is the default.
    #[arg(short = 'x', long)]
    exclusive: bool,

    /// Rows each worker may hold in memory, e.g. `512MiB`. A bare number below 1Mi is in MiB.
    #[arg(short, long, value_name = "SIZE", value_parser = parse_size)]
    memory: Option<u64>,

    /// Add a text dataset of this name recording each row's input file.
    #[arg(short, long, value_name = "NAME")]
    provenance: Option<String>,

    /// Only merge top-level groups whose whole name matches. May be repeated.
    #[arg(short, long = "group", value_name = "REGEX")]
    groups: Vec<String>,

    /// Create output datasets without the inputs' compression filters.
    #[arg(long)]
    no_filters: bool,

    /// Synchronize all workers around every write.
    #[arg(long)]
    collective: bool,

    #[arg(short, long, value_name = "N", default_value = "1")]
    workers: NonZeroUsize,

    #[arg(short, long, value_name = "PATH")]
    output: PathBuf,

    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Append,
    Truncate,
    Exclusive,
}

impl MergeArgs {
    fn mode(&self) -> OutputMode {
        if self.append {
            OutputMode::Append
        } else if self.truncate {
            OutputMode::Truncate
        } else {
            OutputMode::Exclusive
        }
    }

    fn options(&self) -> anyhow::Result<ConcatOptions> {
        let mut options = ConcatOptions::default()
            .with_memory_bytes(self.memory.unwrap_or(DEFAULT_MEMORY_BYTES))
            .with_propagate_filters(!self.no_filters)
            .with_collective(self.collective);
        if let Some(name) = &self.provenance {
            options = options.with_provenance(name);
        }
        for pattern in &self.groups {
            options = options.with_group_filter(anchored(pattern)?);
        }
        Ok(options)
    }
}

/// Compile `pattern` so that it must match a whole group name.
fn anchored(pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .with_context(|| format!("invalid group pattern '{pattern}'"))
}

fn open_output(path: &Path, mode: OutputMode) -> NtupleResult<Container> {
    match mode {
        OutputMode::Append => Container::open_or_create(path),
        OutputMode::Truncate => Container::create(path, CreateMode::Truncate),
        OutputMode::Exclusive => Container::create(path, CreateMode::Exclusive),
    }
}

/// Refuse to merge a file into itself before the output is opened, as truncating would
/// destroy the input.
fn check_inputs(output: &Path, inputs: &[PathBuf]) -> anyhow::Result<()> {
    let Ok(output) = output.canonicalize() else {
        return Ok(());
    };
    for input in inputs {
        if input.canonicalize().is_ok_and(|input| input == output) {
            bail!("{} is both an input and the output", input.display());
        }
    }
    Ok(())
}

/// Run the merge. Returns whether every input merged without failure.
pub fn exec_merge(args: MergeArgs) -> anyhow::Result<bool> {
    let options = args.options()?;
    check_inputs(&args.output, &args.inputs)?;
    let output = open_output(&args.output, args.mode())
        .with_context(|| format!("cannot open output {}", args.output.display()))?;

    let inputs = &args.inputs;
    let summaries = ThreadGroup::run(args.workers.get(), |comm| {
        let mut concat = Concatenator::new(output.clone(), comm, options.clone())?;
        for input in inputs {
            concat.add_file(input);
        }
        NtupleResult::Ok(concat.finish())
    });
    // Every worker agrees on the summary; the first one speaks for all.
    let summary: ConcatSummary = summaries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no workers ran"))??;
    output.close()?;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or_default();
    println!(
        "{}: {} rows from {} of {} inputs, {}",
        args.output.display(),
        summary.rows,
        summary.files,
        args.inputs.len(),
        format_size(size, BINARY)
    );
    for failure in &summary.failures {
        eprintln!("failed: {failure}");
    }
    Ok(summary.is_success())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use ntuple::{ColumnDescriptor, Locator, Ntuple, PathMode, row};
    use ntuple_store::{ElementType, OpenMode};
    use rstest::rstest;

    use super::*;

    #[derive(Debug, Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: MergeArgs,
    }

    fn parse(args: &[&str]) -> Result<MergeArgs, clap::Error> {
        Wrapper::try_parse_from(std::iter::once("merge").chain(args.iter().copied()))
            .map(|w| w.args)
    }

    fn write_table(path: &Path, group: &str, values: &[u16]) {
        let table = Ntuple::builder(group)
            .column(ColumnDescriptor::scalar("v", ElementType::U16).unwrap())
            .build(Locator::path(path, PathMode::CreateExclusive))
            .unwrap();
        for v in values {
            table.insert(&row![*v]).unwrap();
        }
    }

    #[rstest]
    #[case(&[], OutputMode::Exclusive)]
    #[case(&["-a"], OutputMode::Append)]
    #[case(&["--truncate"], OutputMode::Truncate)]
    #[case(&["-x"], OutputMode::Exclusive)]
    fn modes(#[case] flags: &[&str], #[case] mode: OutputMode) {
        let mut argv = flags.to_vec();
        argv.extend(["-o", "out.ntpl", "in.ntpl"]);
        assert_eq!(parse(&argv).unwrap().mode(), mode);
    }

    #[test]
    fn modes_are_exclusive_of_each_other() {
        assert!(parse(&["-a", "-t", "-o", "out.ntpl", "in.ntpl"]).is_err());
    }

    #[test]
    fn inputs_are_required() {
        assert!(parse(&["-o", "out.ntpl"]).is_err());
    }

    #[test]
    fn options_from_flags() {
        let args = parse(&[
            "-m", "16", "-p", "file", "-g", "run[0-9]+", "--no-filters", "-w", "3", "-o",
            "out.ntpl", "a.ntpl", "b.ntpl",
        ])
        .unwrap();
        assert_eq!(args.workers.get(), 3);
        let options = args.options().unwrap();
        assert_eq!(options.memory_bytes, 16 << 20);
        assert_eq!(options.provenance.as_deref(), Some("file"));
        assert!(!options.propagate_filters);
        assert!(options.group_filters[0].is_match("run12"));
        assert!(!options.group_filters[0].is_match("run12_old"));
    }

    #[test]
    fn bad_group_patterns_are_reported() {
        let args = parse(&["-g", "(", "-o", "out.ntpl", "in.ntpl"]).unwrap();
        assert!(args.options().is_err());
    }

    #[test]
    fn merge_with_workers() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ntpl");
        let b = dir.path().join("b.ntpl");
        write_table(&a, "t", &[1, 2, 3]);
        write_table(&b, "t", &[4, 5]);
        let out = dir.path().join("out.ntpl");

        let argv = [
            "-w",
            "2",
            "-p",
            "src",
            "-o",
            out.to_str().unwrap(),
            a.to_str().unwrap(),
            b.to_str().unwrap(),
        ];
        assert!(exec_merge(parse(&argv).unwrap()).unwrap());

        let merged = Container::open(&out, OpenMode::ReadOnly).unwrap();
        let t = merged.root().open_group("t").unwrap();
        assert_eq!(
            t.open_dataset("v").unwrap().read_all().unwrap().to_vec::<u16>().unwrap(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(t.open_dataset("src").unwrap().rows().unwrap(), 5);

        // The output exists now; the default mode refuses to overwrite it.
        assert!(exec_merge(parse(&argv).unwrap()).is_err());
    }

    #[test]
    fn the_output_cannot_be_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ntpl");
        write_table(&a, "t", &[1]);
        let path = a.to_str().unwrap();
        let err = exec_merge(parse(&["-t", "-o", path, path]).unwrap()).unwrap_err();
        assert!(err.to_string().contains("both an input and the output"));
        // The input survived.
        assert!(Container::open(&a, OpenMode::ReadOnly).is_ok());
    }
}
