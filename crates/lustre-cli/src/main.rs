use std::{env, fs, process::ExitCode, time::Instant};

use lustre::{ExecutableState, MessageFormat, Module, Project, StateEvent};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "example.lus" };
    let code = match read_file(file_path) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut module = Module::new();
    let mut project = Project::new();
    project.add_code(code, file_path);

    let start = Instant::now();
    let compiled = match project.compile(&mut module, "main") {
        Ok(compiled) => compiled,
        Err(events) => {
            for event in events {
                eprintln!("{}", event.formatted(MessageFormat::Language));
            }
            return ExitCode::FAILURE;
        }
    };
    eprintln!("compiled in {:?}", start.elapsed());

    let mut state = ExecutableState::new(module);
    let run = Instant::now();
    let outcome = state.invoke_entry(compiled.library);
    let elapsed = run.elapsed();

    for event in state.drain_events() {
        match event {
            StateEvent::UnhandledException { exception } => {
                eprintln!("unhandled exception: {exception}");
                eprintln!("{}", exception.trace);
            }
            StateEvent::FatalError { reason, .. } => eprintln!("fatal: {reason}"),
            StateEvent::MemoryLeak { type_name, allocated_at } => match allocated_at {
                Some(location) => eprintln!("leak: {type_name} allocated at {location}"),
                None => eprintln!("leak: {type_name}"),
            },
        }
    }

    match outcome {
        Ok(Some(value)) => {
            eprintln!("finished in {elapsed:?}");
            println!("{value}");
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("finished in {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("could not read {path}: {err}"))
}
