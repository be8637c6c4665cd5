//! Command-line front end for `ts-snip`.
//!
//! Mirrors the Snipper/Project API one-to-one: `analyze` runs an analyze pass and prints a
//! summary, `write` applies a project's slices and rewrites the file, and the `project`
//! subcommands manage the on-disk JSON document.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use ts_snip::{Project, Snipper};

#[derive(Parser)]
#[clap(name = "ts-snip", version, about = "Lossless, frame-accurate MPEG-TS cutting")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a file and print its I-frame count, content hash, and PID table.
    Analyze {
        /// Transport stream file to analyze.
        file: String,
    },
    /// Apply a project's saved slices and write the result.
    Write {
        /// Transport stream file to read.
        file: String,
        /// Project file naming the slices to apply.
        #[clap(long)]
        project: String,
        /// Destination file for the rewritten stream.
        #[clap(short, long)]
        out: String,
    },
    /// Manage project files.
    Project {
        #[clap(subcommand)]
        command: ProjectCommand,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Create a fresh project file for `file`, with no slices.
    New {
        /// Transport stream file the project will track.
        file: String,
        /// Project file to write.
        #[clap(short, long)]
        out: String,
    },
    /// Apply a project's saved slices against its input and print the resulting slice ranges.
    Apply {
        /// Project file to load.
        project: String,
    },
    /// Check whether a project's recorded content hash still matches its input file.
    Validate {
        /// Project file to check.
        project: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Analyze { file } => cmd_analyze(&file),
        Command::Write { file, project, out } => cmd_write(&file, &project, &out),
        Command::Project { command } => match command {
            ProjectCommand::New { file, out } => cmd_project_new(&file, &out),
            ProjectCommand::Apply { project } => cmd_project_apply(&project),
            ProjectCommand::Validate { project } => cmd_project_validate(&project),
        },
    }
}

fn cmd_analyze(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snipper = Snipper::open(file)?;
    snipper.analyze(|| true)?;

    println!("file:     {}", snipper.filename());
    println!("iframes:  {}", snipper.iframe_count());
    println!("sha1:     {}", snipper.sha1().unwrap_or_default());
    println!("pids:");
    for (pid, stream_type) in snipper.pid_table() {
        match stream_type {
            Some(st) => println!("  0x{pid:04x}  {st:?}"),
            None => println!("  0x{pid:04x}  (untyped)"),
        }
    }
    Ok(())
}

fn cmd_write(file: &str, project_file: &str, out: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut project = Project::new_from_file(project_file)?;
    if project.snipper().filename() != file {
        return Err(format!(
            "project {project_file} names input {}, not {file}",
            project.snipper().filename()
        )
        .into());
    }
    if !project.validate() {
        eprintln!("warning: input file content hash no longer matches the saved project");
    }

    project.snipper().analyze(|| true)?;
    project.apply_slices();

    let mut out_file = File::create(out)?;
    let mut sink = |bytes: &[u8]| out_file.write_all(bytes).is_ok();
    project.snipper().write(&mut sink)?;
    Ok(())
}

fn cmd_project_new(file: &str, out: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snipper = Arc::new(Snipper::open(file)?);
    let project = Project::new(snipper);
    project.write(out)?;
    Ok(())
}

fn cmd_project_apply(project_file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut project = Project::new_from_file(project_file)?;
    project.snipper().analyze(|| true)?;
    project.apply_slices();

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    project.snipper().enum_slices(|s| {
        let _ = writeln!(handle, "{} .. {} (bytes {}..{})", s.begin_frame, s.end_frame, s.begin, s.end);
    });
    Ok(())
}

fn cmd_project_validate(project_file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let project = Project::new_from_file(project_file)?;
    if project.validate() {
        println!("ok");
        Ok(())
    } else {
        Err("input file content hash does not match the saved project".into())
    }
}
