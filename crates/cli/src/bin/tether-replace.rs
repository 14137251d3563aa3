//! Filter executable used by the repository's clean and smudge commands
//!
//! `tether-replace <from> <to> [<from> <to>...]` copies stdin to stdout with
//! every base64-encoded `from` replaced by its `to`, in argument order.
//! Input that is not UTF-8 passes through untouched.

use std::io::{self, Read, Write};
use std::process::ExitCode;
use tether_secrets::replace::{apply_pairs, decode_pairs};

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let pairs = decode_pairs(&args)?;

    let mut input = Vec::new();
    io::stdin().lock().read_to_end(&mut input)?;

    let mut stdout = io::stdout().lock();
    match std::str::from_utf8(&input) {
        Ok(text) => stdout.write_all(apply_pairs(text, &pairs).as_bytes())?,
        Err(_) => stdout.write_all(&input)?,
    }
    stdout.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tether-replace: {e:#}");
            ExitCode::FAILURE
        }
    }
}
