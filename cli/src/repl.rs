//! Interactive session: reedline in front of a persistent
//! [`tarn_core::ReplSession`].

use std::process::ExitCode;

use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tarn_core::{EngineOptions, Error, ReplSession};

use crate::builtins;

pub fn run() -> ExitCode {
    let mut options = EngineOptions::default();
    options.vm.import_files = true;
    let mut session = ReplSession::new(options);
    builtins::register_repl(&mut session);

    let mut line_editor = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("tarn".to_string()),
        DefaultPromptSegment::Empty,
    );

    println!("Tarn REPL - Ctrl+D to exit");

    loop {
        match line_editor.read_line(&prompt) {
            Ok(Signal::Success(buffer)) => match session.eval(&buffer) {
                Ok(Some(rendered)) => println!("{rendered}"),
                Ok(None) => {}
                Err(Error::Runtime(e)) => eprintln!("runtime error: {}", e.message),
                Err(err) => eprintln!("error: {err}"),
            },
            Ok(Signal::CtrlC) => continue,
            Ok(Signal::CtrlD) => return ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("input error: {err}");
                return ExitCode::from(2);
            }
        }
    }
}
