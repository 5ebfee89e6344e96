use tracing::info;

use pocketllm_core::{Prompt, Request, Turn};

use super::{
    finish, inactivity_timeout, print_text, resolve_model, start_controller, stop_controller,
    SamplingArgs,
};
use crate::config::AppConfig;
use crate::consumer::stream_request;

/// Run a single prompt and stream the reply to stdout.
pub async fn run(
    model: Option<&str>,
    prompt: &str,
    system: &str,
    raw: bool,
    sampling: SamplingArgs,
    stats: bool,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let (model_id, model_path) = resolve_model(model, config)?;
    info!(model = %model_id, path = %model_path.display(), "Running prompt");

    let (controller, mut events) = start_controller(config)?;
    let handle = controller.handle();

    // --raw sends the text verbatim, without template or system block.
    let (prompt, system) = if raw {
        (Prompt::Text(prompt.to_string()), None)
    } else {
        (Prompt::Turns(vec![Turn::user(prompt)]), Some(system.to_string()))
    };
    let request = Request {
        id: 1,
        model_path,
        prompt,
        system,
        max_tokens: sampling.max_tokens(config),
        temperature: sampling.temperature(config),
        top_p: sampling.top_p(config),
    };

    let timeout = inactivity_timeout(config);
    let outcome = stream_request(&handle, &mut events, request, timeout, print_text).await?;
    println!();

    stop_controller(controller).await?;
    finish(outcome, stats, timeout)
}
