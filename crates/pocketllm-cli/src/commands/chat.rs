use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use pocketllm_core::{Prompt, Request, RequestId, Turn};

use super::{
    finish, inactivity_timeout, print_text, resolve_model, start_controller, stop_controller,
    SamplingArgs,
};
use crate::config::AppConfig;
use crate::consumer::{stream_request, Outcome};

/// Start an interactive multi-turn chat session.
///
/// The model is warmed up once and stays loaded in the session worker. The
/// whole conversation is resent each turn; the worker trims the oldest turns
/// to fit the context window. Type `/quit` or press Ctrl+D to exit.
pub async fn run(
    model: Option<&str>,
    system: &str,
    sampling: SamplingArgs,
    stats: bool,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let (model_id, model_path) = resolve_model(model, config)?;
    let (controller, mut events) = start_controller(config)?;
    let handle = controller.handle();
    handle.warmup(&model_path);
    info!(model = %model_id, "Chat session started");

    println!("\npocketllm chat  |  model: {model_id}  |  /clear resets, /quit exits\n");

    let timeout = inactivity_timeout(config);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<Turn> = Vec::new();
    let mut next_id: RequestId = 1;

    loop {
        print!("You: ");
        io::stdout().flush()?;

        let Some(line) = stdin.next_line().await? else {
            // EOF
            println!("\nGoodbye!");
            break;
        };
        let user_input = line.trim();
        match user_input {
            "" => continue,
            "/quit" | "/exit" => {
                println!("Goodbye!");
                break;
            }
            "/clear" => {
                history.clear();
                println!("[Conversation history cleared]\n");
                continue;
            }
            _ => {}
        }

        history.push(Turn::user(user_input));
        let request = Request {
            id: next_id,
            model_path: model_path.clone(),
            prompt: Prompt::Turns(history.clone()),
            system: Some(system.to_string()),
            max_tokens: sampling.max_tokens(config),
            temperature: sampling.temperature(config),
            top_p: sampling.top_p(config),
        };
        next_id += 1;

        print!("\nAssistant: ");
        io::stdout().flush()?;
        let mut reply = String::new();
        let outcome = stream_request(&handle, &mut events, request, timeout, |text| {
            reply.push_str(text);
            print_text(text)
        })
        .await?;
        println!("\n");

        match outcome {
            Outcome::Completed { .. } => {
                history.push(Turn::assistant(reply));
                finish(outcome, stats, timeout)?;
            }
            Outcome::Disconnected => {
                finish(outcome, stats, timeout)?;
            }
            // The unanswered turn is dropped so the next prompt starts clean.
            other => {
                history.pop();
                if let Err(e) = finish(other, stats, timeout) {
                    warn!(error = %e, "Turn failed");
                    eprintln!("[error] {e}");
                }
            }
        }
    }

    stop_controller(controller).await
}
