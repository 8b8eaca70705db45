use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use vocalink::audio::{WavAudioSource, WavAudioWriter};
use vocalink::cli::{Cli, Commands, ConfigAction, SessionArgs};
use vocalink::config::Config;
use vocalink::conversation::ConversationBuilder;
use vocalink::defaults;
use vocalink::model::EchoBackend;
use vocalink::pipeline::metrics::format_duration;
use vocalink::runner::PipelineRunner;
use vocalink::task::{PipelineEvent, StopReason, TaskOutcome, TaskParams};
use vocalink::transport::{ChannelTransport, ChannelTransportHandle, OutputItem, TransportParams};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    vocalink::logging::init(cli.quiet, cli.verbose);

    match cli.command {
        Commands::Run {
            input,
            text,
            output,
            realtime,
            session,
        } => {
            let config = load_config(cli.config.as_deref())?;
            run_wav(config, &input, text, output, realtime, session, cli.quiet).await?;
        }
        Commands::Chat { session } => {
            let config = load_config(cli.config.as_deref())?;
            run_chat(config, session, cli.quiet).await?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "vocalink",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/vocalink/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path())?,
    };

    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            println!("{}", config.get_value_by_path(&key)?);
        }
        ConfigAction::Show => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
        ConfigAction::Dump => {
            print!("{}", Config::dump_template());
        }
    }
    Ok(())
}

/// Task parameters from config, with command-line overrides applied.
fn task_params(
    config: &Config,
    args: &SessionArgs,
) -> (TaskParams, Option<crossbeam_channel::Receiver<PipelineEvent>>) {
    let mut params = TaskParams::from_config(config);
    if let Some(timeout) = args.idle_timeout {
        params.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
    }
    if args.no_greeting {
        params.initial_prompt = None;
    }
    if args.metrics {
        params.enable_metrics = true;
        params.enable_usage_metrics = true;
    }

    if !args.events {
        return (params, None);
    }
    let (tx, rx) = crossbeam_channel::bounded(256);
    (params.with_events(tx), Some(rx))
}

fn echo_backend(args: &SessionArgs, speak: bool) -> EchoBackend {
    EchoBackend::new()
        .with_audio(speak)
        .with_word_delay(args.word_delay.unwrap_or(Duration::from_millis(30)))
}

/// Prints pipeline events on a plain thread; ends when the task drops its sender.
fn spawn_event_printer(events: Option<crossbeam_channel::Receiver<PipelineEvent>>) {
    let Some(events) = events else {
        return;
    };
    std::thread::spawn(move || {
        for event in events.iter() {
            match event.to_json() {
                Ok(json) => eprintln!("{}", json),
                Err(e) => eprintln!("Error: failed to encode event: {}", e),
            }
        }
    });
}

fn spawn_output_printer(
    output: mpsc::Receiver<OutputItem>,
    writer: Option<WavAudioWriter>,
    quiet: bool,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(print_output(output, writer, quiet))
}

/// Prints response text and writes response audio until the output closes.
async fn print_output(
    mut output: mpsc::Receiver<OutputItem>,
    mut writer: Option<WavAudioWriter>,
    quiet: bool,
) -> Result<()> {
    let color = std::io::stdout().is_terminal();
    let mut at_line_start = true;
    while let Some(item) = output.recv().await {
        match item {
            OutputItem::Text(text) => {
                if quiet {
                    continue;
                }
                if at_line_start {
                    if color {
                        print!("{} ", "assistant>".green());
                    } else {
                        print!("assistant> ");
                    }
                    at_line_start = false;
                }
                print!("{}", text);
                std::io::stdout().flush()?;
            }
            OutputItem::Audio(chunk) => {
                if let Some(writer) = writer.as_mut() {
                    writer.write_chunk(&chunk)?;
                }
            }
            OutputItem::TurnComplete => {
                if !at_line_start {
                    println!();
                    at_line_start = true;
                }
            }
            OutputItem::Interrupted => {
                if !quiet && !at_line_start {
                    if color {
                        println!(" {}", "[interrupted]".yellow());
                    } else {
                        println!(" [interrupted]");
                    }
                    at_line_start = true;
                }
            }
        }
    }
    if let Some(writer) = writer {
        let samples = writer.samples_written();
        writer.finalize()?;
        if !quiet {
            eprintln!("Wrote {} samples of response audio", samples);
        }
    }
    Ok(())
}

async fn run_wav(
    config: Config,
    input: &Path,
    text: Option<String>,
    output: Option<PathBuf>,
    realtime: bool,
    args: SessionArgs,
    quiet: bool,
) -> Result<()> {
    let source = WavAudioSource::from_path(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let writer = output
        .as_deref()
        .map(|path| WavAudioWriter::create(path, defaults::SAMPLE_RATE))
        .transpose()?;

    let (params, events) = task_params(&config, &args);
    let (mut transport, mut peer) =
        ChannelTransport::new(TransportParams::default(), params.queue_capacity);
    let backend = echo_backend(&args, writer.is_some());
    let (task, context) = ConversationBuilder::from_config(backend, &config)
        .build(&mut transport, &params)?
        .into_task(params);

    spawn_event_printer(events);
    let printer = spawn_output_printer(take_output(&mut peer)?, writer, quiet);
    let running = tokio::spawn(async move { PipelineRunner::new().run(task).await });

    peer.connect().await?;
    // Delivered up front so the turn commits as text when the VAD closes it
    if let Some(text) = text {
        peer.send_text(text).await?;
    }
    for chunk in source {
        if realtime {
            tokio::time::sleep(chunk.duration()).await;
        }
        peer.send_audio(chunk).await?;
    }
    // Closes a turn the file ends in the middle of
    peer.end_of_turn().await?;
    peer.close_input();

    let outcome = running.await??;
    printer.await??;
    report(&outcome, context.len(), quiet);
    Ok(())
}

async fn run_chat(config: Config, args: SessionArgs, quiet: bool) -> Result<()> {
    let (params, events) = task_params(&config, &args);
    let (mut transport, mut peer) =
        ChannelTransport::new(TransportParams::default(), params.queue_capacity);
    let (task, context) = ConversationBuilder::from_config(echo_backend(&args, false), &config)
        .build(&mut transport, &params)?
        .into_task(params);

    spawn_event_printer(events);
    let printer = spawn_output_printer(take_output(&mut peer)?, None, quiet);
    let running = tokio::spawn(async move { PipelineRunner::new().run(task).await });

    if !quiet {
        eprintln!("Type a message and press Enter. /quit or Ctrl-D ends the session.");
    }
    peer.connect().await?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut disconnected = false;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            peer.disconnect().await?;
            disconnected = true;
            break;
        }
        if peer.send_text(line).await.is_err() || peer.end_of_turn().await.is_err() {
            // Pipeline stopped (idle timeout or signal)
            break;
        }
    }
    if !disconnected {
        peer.close_input();
    }

    let outcome = running.await??;
    printer.await??;
    report(&outcome, context.len(), quiet);
    Ok(())
}

fn take_output(peer: &mut ChannelTransportHandle) -> Result<mpsc::Receiver<OutputItem>> {
    peer.take_output()
        .context("transport output already taken")
}

fn report(outcome: &TaskOutcome, messages: usize, quiet: bool) {
    if quiet {
        return;
    }
    let reason = match &outcome.reason {
        StopReason::Completed => "completed".to_string(),
        StopReason::Cancelled(reason) => reason.to_string(),
    };
    eprintln!(
        "Session {}: {} turns, {} messages in context",
        reason, outcome.metrics.turns, messages
    );
    if let Some(latency) = &outcome.metrics.latency {
        eprintln!(
            "Latency: first response avg {} (min {}, max {}), completion avg {}",
            format_duration(latency.response_avg),
            format_duration(latency.response_min),
            format_duration(latency.response_max),
            format_duration(latency.total_avg),
        );
    }
    if outcome.metrics.prompt_tokens > 0 || outcome.metrics.completion_tokens > 0 {
        eprintln!(
            "Tokens: {} prompt, {} completion",
            outcome.metrics.prompt_tokens, outcome.metrics.completion_tokens
        );
    }
    if !outcome.aborted.is_empty() {
        eprintln!(
            "{} {}",
            "Aborted after grace period:".red(),
            outcome.aborted.join(", ")
        );
    }
}
