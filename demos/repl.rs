use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use std::time::Duration;
use trslisp::builtinops::{OpKind, get_builtin_ops};
use trslisp::reader::read_program;
use trslisp::{EvalConfig, Interpreter};

/// Wall-clock budget for each line entered
const LINE_BUDGET: Duration = Duration::from_secs(5);

fn main() {
    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("trslisp: a small Lisp with term rewriting");
    println!("Enter S-expressions like: (+ 1 2)");
    println!("Rewrite with: (trs '(f 2 3) (f X:number Y:number) -> [+ X Y])");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut interp = Interpreter::new();

    #[cfg(feature = "json")]
    let mut json_mode = false;

    loop {
        match rl.readline("trslisp> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                // Add the line to history
                let _ = rl.add_history_entry(line);

                // Handle special commands
                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":env" => {
                        print_environment(&interp);
                        continue;
                    }
                    ":ops" => {
                        print_builtin_ops();
                        continue;
                    }
                    ":checked" => {
                        let checked = !interp.is_checked();
                        interp.set_config(EvalConfig {
                            checked,
                            ..interp.config()
                        });
                        println!("Checked mode {}", if checked { "enabled" } else { "disabled" });
                        continue;
                    }
                    #[cfg(feature = "json")]
                    ":json" => {
                        json_mode = !json_mode;
                        println!("JSON output {}", if json_mode { "enabled" } else { "disabled" });
                        continue;
                    }
                    ":reset" => {
                        interp.reset();
                        println!("All variables and functions forgotten.");
                        continue;
                    }
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ => {}
                }

                let forms = match read_program(line) {
                    Ok(forms) => forms,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };

                interp.clear_output();
                interp.set_time_budget(Some(LINE_BUDGET));
                for form in &forms {
                    let result = interp.eval(form);
                    if !interp.output().is_empty() {
                        println!("{}", interp.output());
                        interp.clear_output();
                    }
                    match result {
                        #[cfg(feature = "json")]
                        Ok(value) if json_mode => match trslisp::json::to_json(&value) {
                            Ok(json) => println!("{json}"),
                            Err(_) => println!("{value}"), // Fallback to S-expression if conversion fails
                        },
                        Ok(value) => println!("{value}"),
                        Err(e) => {
                            println!("{e}");
                            break;
                        }
                    }
                }
                interp.set_time_budget(None);
            }

            Err(ReadlineError::Eof | ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("trslisp REPL commands:");
    println!("  :help    - Show this help message");
    println!("  :env     - Show variables and user functions");
    println!("  :ops     - List builtin functions and special forms");
    println!("  :checked - Toggle argument count and type checks");
    #[cfg(feature = "json")]
    println!("  :json    - Toggle JSON output of results");
    println!("  :reset   - Forget all variables and functions");
    println!("  :quit    - Exit the interpreter");
    println!("  :exit    - Exit the interpreter");
    println!("  Ctrl+C   - Exit the interpreter");
    println!();
    println!("Examples:");
    println!("  (+ 3 4 (* 5 6))");
    println!("  (defun sq (x) (* x x)) (sq 5)");
    println!("  (let ((x 1)) (let ((x 2)) x))");
    println!("  (rewrite '(x (a) (a)) '('(a) t '(b)))");
    println!("  (trs '(1 b 3 3 4 5 66 77 88) (1 b X X Y:number Z:number W*) -> (blub X Y [+ 2 X] W ~ W))");
    println!();
}

fn print_environment(interp: &Interpreter) {
    let bindings = interp.environment().visible_bindings();
    let functions = interp.function_names();

    if bindings.is_empty() && functions.is_empty() {
        println!("Environment is empty.");
        return;
    }

    if !bindings.is_empty() {
        println!("Variables ({}):", bindings.len());
        for (name, value) in bindings {
            println!("  {name} = {value}");
        }
    }

    if !functions.is_empty() {
        println!("Functions ({}):", functions.len());
        for name in functions {
            println!("  {name}");
        }
    }
}

fn print_builtin_ops() {
    let (special_forms, functions): (Vec<_>, Vec<_>) = get_builtin_ops()
        .iter()
        .partition(|op| matches!(op.op_kind, OpKind::SpecialForm(_)));

    for (title, ops) in [("Special forms", special_forms), ("Functions", functions)] {
        println!("{title} ({}):", ops.len());
        // Print in columns for readability
        let mut col = 0;
        for op in ops {
            print!("  {:<15}", op.name);
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }
}
