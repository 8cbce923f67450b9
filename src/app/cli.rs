use std::{
    collections::HashMap,
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    execute, terminal,
};

use crate::manager::task_manager::TaskManager;
use crate::registry::template::placeholders;

const PROMPT: &str = ">>> ";
const WATCH_POLL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Tabs,
    NewTab(String),
    Modules,
    Create {
        tab: u64,
        module: String,
        inputs: HashMap<String, String>,
    },
    Start(u64),
    Stop(u64),
    Delete(u64),
    Status(u64),
    Watch(u64),
    List(u64),
    Vars,
    Set(String, String),
    Help,
    Exit,
}

/// Parses one console line. `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut args = line.split_whitespace();
    let Some(word) = args.next() else {
        return Ok(None);
    };
    let command = match word {
        "tabs" => Command::Tabs,
        "tab" => Command::NewTab(args.collect::<Vec<_>>().join(" ")),
        "modules" => Command::Modules,
        "create" => {
            let tab = parse_id(args.next(), "Tab")?;
            let module = args
                .next()
                .ok_or_else(|| "Module ID must be specified.".to_string())?
                .to_string();
            let mut inputs = HashMap::new();
            for arg in args {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| format!("Expected key=value, got '{}'.", arg))?;
                inputs.insert(key.to_string(), value.to_string());
            }
            Command::Create {
                tab,
                module,
                inputs,
            }
        }
        "start" => Command::Start(parse_id(args.next(), "Task")?),
        "stop" => Command::Stop(parse_id(args.next(), "Task")?),
        "delete" => Command::Delete(parse_id(args.next(), "Task")?),
        "status" => Command::Status(parse_id(args.next(), "Task")?),
        "watch" => Command::Watch(parse_id(args.next(), "Task")?),
        "list" => Command::List(parse_id(args.next(), "Tab")?),
        "vars" => Command::Vars,
        "set" => {
            let key = args
                .next()
                .ok_or_else(|| "Variable name must be specified.".to_string())?;
            Command::Set(key.to_string(), args.collect::<Vec<_>>().join(" "))
        }
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        other => return Err(format!("Unknown command: {}. Type 'help' for a list.", other)),
    };
    Ok(Some(command))
}

fn parse_id(arg: Option<&str>, what: &str) -> Result<u64, String> {
    let arg = arg.ok_or_else(|| format!("{} ID must be specified.", what))?;
    arg.parse::<u64>()
        .map_err(|_| format!("Invalid {} ID format: '{}'.", what.to_lowercase(), arg))
}

struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Prints text in raw mode, where a bare newline does not return the cursor.
fn say(text: &str) {
    for line in text.lines() {
        print!("\r{}\r\n", line);
    }
    let _ = io::stdout().flush();
}

fn clear_line(input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!("{}{}", PROMPT, input);
    io::stdout().flush()
}

fn is_interrupt(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('d'))
}

/// Reads one line with ↑/↓ history. `None` on Ctrl-C / Ctrl-D.
fn read_line(history: &[String]) -> io::Result<Option<String>> {
    let mut input = String::new();
    let mut index = history.len();
    clear_line(&input)?;

    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if is_interrupt(&key) {
            print!("\r\n");
            return Ok(None);
        }
        match key.code {
            KeyCode::Enter => {
                print!("\r\n");
                return Ok(Some(input));
            }
            KeyCode::Up => {
                if index > 0 {
                    index -= 1;
                    input = history[index].clone();
                    clear_line(&input)?;
                }
            }
            KeyCode::Down => {
                if index < history.len() {
                    index += 1;
                    input = history.get(index).cloned().unwrap_or_default();
                    clear_line(&input)?;
                }
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                clear_line(&input)?;
            }
            _ => {}
        }
    }
}

/// Runs the interactive console until `exit` or Ctrl-C.
pub fn run_console(manager: Arc<TaskManager>) -> io::Result<()> {
    let _raw = RawMode::enable()?;
    say("Scan engine console. Type 'help' for commands, 'exit' to quit.");
    let mut history: Vec<String> = Vec::new();

    while let Some(input) = read_line(&history)? {
        let input = input.trim().to_string();
        if input.is_empty() {
            continue;
        }
        if history.last() != Some(&input) {
            history.push(input.clone());
        }
        match parse_command(&input) {
            Ok(Some(Command::Exit)) => break,
            Ok(Some(command)) => execute(&manager, command)?,
            Ok(None) => {}
            Err(message) => say(&message),
        }
    }
    say("Exiting the console...");
    Ok(())
}

fn execute(manager: &TaskManager, command: Command) -> io::Result<()> {
    let outcome = match command {
        Command::Tabs => manager.list_tabs().map(|tabs| {
            if tabs.is_empty() {
                say("No tabs. Use `tab <name>` to create one.");
            }
            for tab in tabs {
                say(&format!("{}\t{}", tab.id, tab.name));
            }
        }),
        Command::NewTab(name) => manager
            .create_tab(&name)
            .map(|tab| say(&format!("Created tab {} ({}).", tab.id, tab.name))),
        Command::Modules => {
            for module in manager.list_modules().iter() {
                let vars = module
                    .plan()
                    .first()
                    .map(|step| placeholders(&step.command).join(" "))
                    .unwrap_or_default();
                say(&format!(
                    "{:<24} {:<14} {} [{}]",
                    module.id,
                    module.kind.as_str(),
                    module.name,
                    vars
                ));
            }
            Ok(())
        }
        Command::Create {
            tab,
            module,
            inputs,
        } => manager.create_task(tab, &module, &inputs).map(|id| {
            say(&format!("Created task with ID: {}", id));
            say(&format!("Use `start {}` to run it.", id));
        }),
        Command::Start(id) => manager
            .start_task(id)
            .map(|_| say(&format!("Task {} started.", id))),
        Command::Stop(id) => manager
            .stop_task(id)
            .map(|_| say(&format!("Sent stop signal for task {}.", id))),
        Command::Delete(id) => manager
            .delete_task(id)
            .map(|_| say(&format!("Task {} deleted.", id))),
        Command::Status(id) => manager.get_task(id).map(|task| {
            let pid = task
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "NONE".to_string());
            say(&format!(
                "Task {} {} (pid {}) {}",
                id,
                task.status,
                pid,
                task.marker.unwrap_or_default()
            ));
        }),
        Command::List(tab) => manager.list_tasks(tab).map(|tasks| {
            if tasks.is_empty() {
                say("No tasks in this tab.");
                return;
            }
            say(&format!("{}\t{:<10}\t{:<8}\t{}", "ID", "Status", "Time", "Command"));
            say(&"-".repeat(60));
            for task in tasks {
                say(&format!(
                    "{}\t{:<10}\t{:<8}\t{}",
                    task.id, task.status, task.time, task.cmd
                ));
            }
        }),
        Command::Watch(id) => return watch(manager, id),
        Command::Vars => manager.global_vars().map(|vars| {
            for (key, value) in vars {
                say(&format!("{}={}", key, value));
            }
        }),
        Command::Set(key, value) => manager
            .set_global_var(&key, &value)
            .map(|_| say(&format!("{} set.", key))),
        Command::Help => {
            say("tabs | tab <name> | modules | create <tab> <module> key=value...");
            say("start|stop|delete|status|watch <task> | list <tab> | vars | set <key> <value> | exit");
            Ok(())
        }
        Command::Exit => Ok(()),
    };
    if let Err(e) = outcome {
        say(&format!("Error: {}", e));
    }
    Ok(())
}

/// Follows a task's output until it ends or a key is pressed.
fn watch(manager: &TaskManager, id: u64) -> io::Result<()> {
    say(&format!("Watching task {}. Press any key to stop watching.", id));
    let mut offset = 0;
    let mut partial = String::new();
    loop {
        let snapshot = match manager.read_output_from(id, offset) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                say(&format!("Error: {}", e));
                return Ok(());
            }
        };
        partial.push_str(&snapshot.output);
        say(&take_complete_lines(&mut partial));
        offset = snapshot.next_offset;
        if snapshot.status.is_terminal() {
            say(&partial);
            say(&format!(
                "Task {} {} ({}).",
                id,
                snapshot.status,
                snapshot.marker.unwrap_or_default()
            ));
            return Ok(());
        }
        if event::poll(WATCH_POLL)? {
            if let Event::Key(_) = event::read()? {
                say("Stopped watching.");
                return Ok(());
            }
        }
    }
}

/// Splits off everything up to the last newline, leaving an unfinished
/// line in `buffer` until the rest of it arrives.
fn take_complete_lines(buffer: &mut String) -> String {
    match buffer.rfind('\n') {
        Some(end) => {
            let rest = buffer.split_off(end + 1);
            std::mem::replace(buffer, rest)
        }
        None => String::new(),
    }
}
