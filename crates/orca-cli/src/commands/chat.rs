use console::style;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use orca_core::{StreamEvent, ThinkingStage};
use orca_runtime::Engine;

/// Interactive chat loop on the engine's active session.
///
/// `/new` starts a fresh conversation, `/learn <text>` records feedback and
/// `exit` quits.
pub(super) async fn cmd_chat(engine: Arc<Engine>, stream: bool) -> anyhow::Result<()> {
    println!("{}", style(format!("{} interactive chat", engine.config().name)).bold().cyan());
    println!("   Type 'exit' or Ctrl+C to quit");
    println!("   Type '/new' to start a new conversation");
    println!("   Type '/learn <feedback>' to teach the agent");
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("{} ", style("you>").cyan());
        std::io::stderr().flush().ok();

        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" || trimmed == "/exit" {
            println!("Goodbye!");
            break;
        }

        if trimmed == "/new" {
            match engine.new_conversation().await {
                Ok(id) => println!("{}", style(format!("Started conversation {id}")).dim()),
                Err(e) => eprintln!("{}", style(format!("Error: {e}")).red()),
            }
            continue;
        }
        if let Some(feedback) = trimmed.strip_prefix("/learn") {
            match engine.learn(feedback.trim()).await {
                Ok(()) => println!("{}", style("Noted.").dim()),
                Err(e) => eprintln!("{}", style(format!("Error: {e}")).red()),
            }
            continue;
        }

        if stream {
            stream_turn(&engine, trimmed).await;
        } else {
            match engine.process(trimmed).await {
                Ok(reply) => println!("{} {reply}", style("orca>").green()),
                Err(e) => eprintln!("{}", style(format!("Error: {e}")).red()),
            }
        }
        println!();
    }

    Ok(())
}

/// Run one streamed turn and render its events as they arrive.
async fn stream_turn(engine: &Engine, input: &str) {
    let (tx, mut rx) = mpsc::channel(engine.config().stream_buffer.max(1));

    let render = async {
        let mut started = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Meta { .. } | StreamEvent::Done => {}
                StreamEvent::Thinking { stage, message } => {
                    let marker = match stage {
                        ThinkingStage::ToolError => style(message).red().dim(),
                        _ => style(message).dim(),
                    };
                    eprintln!("  {marker}");
                }
                StreamEvent::Content { delta } => {
                    if !started {
                        print!("{} ", style("orca>").green());
                        started = true;
                    }
                    print!("{delta}");
                    std::io::stdout().flush().ok();
                }
                StreamEvent::Error { message } => {
                    eprintln!("{}", style(format!("Error: {message}")).red());
                }
            }
        }
        if started {
            println!();
        }
    };

    // Failures reach the user as an error event; the result only matters to logs.
    let _ = tokio::join!(engine.process_stream(input, tx), render);
}
