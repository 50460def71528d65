use clap::error::ErrorKind;
use clap::{Arg, ArgAction, Command};
use histext2fs::history::{infer_actions, render_actions};
use histext2fs::{render_tree, Ext2Fs};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::process;

fn main() {
    env_logger::init();

    let command = Command::new("histext2fs")
        .version("1.0")
        .about("Reconstruct the directory tree and operation history of an ext2 image.")
        .arg(
            Arg::new("image")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("The filesystem image to examine."),
        )
        .arg(
            Arg::new("state")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("Where to write the directory tree snapshot."),
        )
        .arg(
            Arg::new("history")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("Where to write the recovered action history."),
        )
        .arg(
            Arg::new("strict-names")
                .long("strict-names")
                .action(ArgAction::SetTrue)
                .help("Reject recovered entries whose names contain non-printable bytes."),
        );

    let matches = match command.try_get_matches() {
        Ok(matches) => matches,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return;
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    let image_path = matches.get_one::<String>("image").unwrap();
    let state_path = matches.get_one::<String>("state").unwrap();
    let history_path = matches.get_one::<String>("history").unwrap();

    let image = match File::open(image_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Failed to open filesystem image {}: {}", image_path, err);
            process::exit(1);
        }
    };

    let mut fs = match Ext2Fs::new(BufReader::new(image)) {
        Ok(fs) => fs,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(1);
        }
    };
    fs.set_strict_names(matches.get_flag("strict-names"));

    let exploration = match fs.explore() {
        Ok(exploration) => exploration,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if let Err(err) = write_file(state_path, |out| render_tree(&exploration.tree, out)) {
        eprintln!("Failed to write {}: {}", state_path, err);
        process::exit(1);
    }

    let actions = infer_actions(&mut fs, &exploration.index);
    if let Err(err) = write_file(history_path, |out| render_actions(&actions, out)) {
        eprintln!("Failed to write {}: {}", history_path, err);
        process::exit(1);
    }
}

fn write_file<F>(path: &str, render: F) -> std::io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut out = BufWriter::new(File::create(path)?);
    render(&mut out)?;
    out.flush()
}
