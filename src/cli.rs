//! Command-line front end over the command layer.

use crate::application::commands::{
    AppState, AssistantStateResponse, assistant_state_impl, cancel_edit_impl, commit_tasks_impl,
    complete_tasks_impl, delete_tasks_impl, get_task_impl, list_tasks_impl,
    load_tasks_for_editing_impl, new_session_impl, next_quote_impl, rearm_alarms_impl,
    save_api_key_impl, save_task_impl, send_message_impl, set_task_completed_impl,
    take_alarm_events, watch_tasks_impl,
};
use crate::domain::models::{Task, TaskPriority};
use crate::infrastructure::alarm_scheduler::AlarmEvent;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about = "Anti-procrastination task manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace holding config/, state/ and logs/
    #[arg(short, long, env = "PROCRASTINAPP_WORKSPACE")]
    workspace: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the root tasks of one bucket
    List {
        /// all, past, now, future, priority, notification, no-date or completed
        #[arg(default_value = "all")]
        filter: String,
    },

    /// Show one task with its subtasks
    Show { id: i64 },

    /// Add a task
    Add {
        title: String,

        /// yyyy-MM-dd or yyyy-MM-dd HH:mm
        #[arg(short, long)]
        deadline: Option<String>,

        /// 0 normal, 1 medium, 2 high, 3 urgent
        #[arg(short, long, default_value_t = 0)]
        priority: i64,

        /// yyyy-MM-dd HH:mm
        #[arg(short, long)]
        notify: Option<String>,

        #[arg(long)]
        notes: Option<String>,

        #[arg(long)]
        periodicity: Option<String>,

        /// Subtask title, repeatable
        #[arg(short, long = "subtask")]
        subtasks: Vec<String>,
    },

    /// Mark tasks completed
    Complete {
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Mark them pending again
        #[arg(long)]
        undo: bool,
    },

    /// Delete tasks together with their subtasks
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Talk to the assistant (type /help inside)
    Chat,

    /// Print a motivational quote
    Quote,

    /// Follow a bucket and print fired reminders
    Watch {
        #[arg(default_value = "now")]
        filter: String,
    },

    /// Store the assistant API key in the OS keyring
    Login { api_key: String },
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let workspace_root = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let state = AppState::new(workspace_root)?;

    match cli.command {
        Commands::List { filter } => {
            let tasks =
                list_tasks_impl(&state, &filter).map_err(|error| state.command_error("list_tasks", &error))?;
            print!("{}", render_tasks(&tasks));
        }
        Commands::Show { id } => {
            let task = get_task_impl(&state, id).map_err(|error| state.command_error("get_task", &error))?;
            print_json(&task)?;
        }
        Commands::Add {
            title,
            deadline,
            priority,
            notify,
            notes,
            periodicity,
            subtasks,
        } => {
            let task = Task {
                deadline: deadline.unwrap_or_default(),
                priority: TaskPriority::from_level(priority),
                notify: notify.unwrap_or_default(),
                notes: notes.unwrap_or_default(),
                periodicity: periodicity.unwrap_or_default(),
                subtasks: subtasks.into_iter().map(Task::new).collect(),
                ..Task::new(title)
            };
            let id = save_task_impl(&state, task).map_err(|error| state.command_error("save_task", &error))?;
            println!("Saved task {id}");
        }
        Commands::Complete { ids, undo } => {
            if undo {
                for id in ids {
                    set_task_completed_impl(&state, id, false)
                        .map_err(|error| state.command_error("set_task_completed", &error))?;
                }
            } else {
                let outcome = complete_tasks_impl(&state, ids)
                    .map_err(|error| state.command_error("complete_tasks", &error))?;
                print_json(&outcome)?;
            }
        }
        Commands::Delete { ids } => {
            let outcome =
                delete_tasks_impl(&state, ids).map_err(|error| state.command_error("delete_tasks", &error))?;
            print_json(&outcome)?;
        }
        Commands::Chat => chat(&state).await?,
        Commands::Quote => {
            let quote = next_quote_impl(&state)
                .await
                .map_err(|error| state.command_error("next_quote", &error))?;
            println!("{quote}");
        }
        Commands::Watch { filter } => watch(&state, &filter).await?,
        Commands::Login { api_key } => {
            save_api_key_impl(&state, api_key).map_err(|error| state.command_error("save_api_key", &error))?;
            println!("API key stored");
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ChatInput {
    Message(String),
    Edit(Vec<i64>),
    Tasks,
    Commit,
    Cancel,
    New,
    Help,
    Quit,
    Empty,
}

impl ChatInput {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Message(line.to_string()));
        };

        let mut words = command.split_whitespace();
        match words.next().unwrap_or_default() {
            "edit" => {
                let ids = words
                    .map(|word| {
                        word.parse::<i64>()
                            .map_err(|_| format!("'{word}' is not a task id"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if ids.is_empty() {
                    return Err("usage: /edit <id> [<id> ...]".to_string());
                }
                Ok(Self::Edit(ids))
            }
            "tasks" => Ok(Self::Tasks),
            "commit" => Ok(Self::Commit),
            "cancel" => Ok(Self::Cancel),
            "new" => Ok(Self::New),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command /{other}, try /help")),
        }
    }
}

const CHAT_HELP: &str = "\
/edit <id>...  load stored tasks into the proposal
/tasks         show the current proposal
/commit        save the proposal (replacing edited tasks)
/cancel        drop the proposal
/new           start a new conversation
/quit          leave";

async fn chat(state: &AppState) -> Result<(), Box<dyn Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Tell me what you are putting off. /help lists commands.");

    while let Some(line) = lines.next_line().await? {
        let input = match ChatInput::parse(&line) {
            Ok(input) => input,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        let result = match input {
            ChatInput::Empty => Ok(()),
            ChatInput::Quit => break,
            ChatInput::Help => {
                println!("{CHAT_HELP}");
                Ok(())
            }
            ChatInput::Message(message) => send_message_impl(state, message)
                .await
                .map(|turn| print_turn(&turn))
                .map_err(|error| state.command_error("send_message", &error)),
            ChatInput::Edit(ids) => match load_tasks_for_editing_impl(state, ids).await {
                Ok(report) => {
                    for error in &report.errors {
                        eprintln!("{error}");
                    }
                    assistant_state_impl(state)
                        .await
                        .map(|current| print_turn(&current))
                        .map_err(|error| state.command_error("assistant_state", &error))
                }
                Err(error) => Err(state.command_error("load_tasks_for_editing", &error)),
            },
            ChatInput::Tasks => assistant_state_impl(state)
                .await
                .map(|current| print!("{}", render_tasks(&current.tasks)))
                .map_err(|error| state.command_error("assistant_state", &error)),
            ChatInput::Commit => commit_tasks_impl(state)
                .await
                .map(|report| {
                    println!(
                        "{:?}: saved {}, failed {}, replaced {}",
                        report.outcome, report.saved, report.failed, report.deleted.succeeded
                    );
                })
                .map_err(|error| state.command_error("commit_tasks", &error)),
            ChatInput::Cancel => cancel_edit_impl(state)
                .await
                .map_err(|error| state.command_error("cancel_edit", &error)),
            ChatInput::New => new_session_impl(state)
                .await
                .map_err(|error| state.command_error("new_session", &error)),
        };

        if let Err(message) = result {
            eprintln!("{message}");
        }
    }

    Ok(())
}

async fn watch(state: &AppState, filter: &str) -> Result<(), Box<dyn Error>> {
    let mut feed = watch_tasks_impl(state, filter).map_err(|error| state.command_error("watch_tasks", &error))?;
    let mut alarms = take_alarm_events(state);
    rearm_alarms_impl(state).map_err(|error| state.command_error("rearm_alarms", &error))?;
    let filter = feed.filter();

    loop {
        tokio::select! {
            update = feed.next() => match update {
                Some(Ok(tasks)) => {
                    println!("-- {filter} ({} tasks)", tasks.len());
                    print!("{}", render_tasks(&tasks));
                }
                Some(Err(error)) => eprintln!("{}", state.command_error("watch_tasks", &error)),
                None => break,
            },
            Some(event) = next_alarm(&mut alarms) => {
                println!("Reminder: {} (task {}, due {})", event.title, event.task_id, event.fire_at);
            }
        }
    }

    Ok(())
}

async fn next_alarm(alarms: &mut Option<mpsc::UnboundedReceiver<AlarmEvent>>) -> Option<AlarmEvent> {
    match alarms {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn print_turn(turn: &AssistantStateResponse) {
    if let Some(reply) = &turn.reply {
        if reply.has_text() {
            println!("{}", reply.text);
        }
        if reply.has_commentary() {
            println!("> {}", reply.commentary);
        }
    }
    if !turn.tasks.is_empty() {
        if !turn.editing_task_ids.is_empty() {
            println!("Editing tasks {:?}", turn.editing_task_ids);
        }
        print!("{}", render_tasks(&turn.tasks));
    }
    if let Some(notice) = &turn.notice {
        eprintln!("{notice}");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_tasks(tasks: &[Task]) -> String {
    let mut out = String::new();
    for task in tasks {
        render_task(task, 0, &mut out);
    }
    out
}

fn render_task(task: &Task, depth: usize, out: &mut String) {
    let mark = if task.completed { "x" } else { " " };
    let id = if task.id > 0 {
        format!("#{} ", task.id)
    } else {
        String::new()
    };
    out.push_str(&format!(
        "{}[{mark}] {id}{} ({})",
        "  ".repeat(depth),
        task.title,
        task.priority.as_str()
    ));
    if !task.deadline.is_empty() {
        out.push_str(&format!(" due {}", task.deadline));
    }
    if !task.notify.is_empty() {
        out.push_str(&format!(" remind {}", task.notify));
    }
    if !task.subtasks.is_empty() {
        out.push_str(&format!(
            " {}/{}",
            task.count_completed_subtasks(),
            task.count_all_subtasks()
        ));
    }
    out.push('\n');
    for subtask in &task.subtasks {
        render_task(subtask, depth + 1, out);
    }
}
