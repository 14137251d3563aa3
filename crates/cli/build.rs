//! Build script for tether-cli.
//!
//! Emits build, rustc and git metadata through vergen so `tether doctor`
//! and `--version` can report what is running on the server.

use vergen_git2::{Emitter, Git2Builder};

fn main() -> anyhow::Result<()> {
    let build = vergen::BuildBuilder::all_build()?;
    let rustc = vergen::RustcBuilder::all_rustc()?;

    vergen::Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&rustc)?
        .emit()?;

    let git2 = Git2Builder::all_git()?;
    Emitter::default().add_instructions(&git2)?.emit()?;

    Ok(())
}
