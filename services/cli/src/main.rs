//! Terminal driver for the fincoach engine.
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Constructing the HTTP backends and injecting them into the core
//!    services.
//! 4. Running the selected flow: the interactive questionnaire or a
//!    one-shot streamed insight.

use anyhow::Context;
use clap::{Parser, Subcommand};
use fincoach_core::{
    backend::HttpQuestionnaireBackend,
    chat_client::{ChatRequest, HttpChatClient},
    insight::{InsightEvent, InsightService},
    profile::classify_investor,
    question::{HealthThresholds, QuestionType, question_health},
    session::{AnswerDraft, QuestionnaireSession, SessionEvent, SessionState},
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::info;

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "fincoach", about = "AI market insights and the investor-psychology questionnaire")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the investor-psychology questionnaire interactively.
    Questionnaire,
    /// Stream one AI market insight for a prompt.
    Insight {
        /// Prompt describing the data to analyze.
        #[arg(long)]
        prompt: String,
        /// Model override; defaults to CHAT_MODEL.
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Questionnaire => run_questionnaire(&config).await,
        Command::Insight { prompt, model } => run_insight(&config, prompt, model).await,
    }
}

async fn run_questionnaire(config: &Config) -> anyhow::Result<()> {
    let backend = Arc::new(HttpQuestionnaireBackend::new(&config.questionnaire_base));
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let session = QuestionnaireSession::new(backend).with_events(events_tx);

    // Mirror streaming question text to the terminal as it arrives.
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::QuestionStreaming(text) => {
                    print!("\r{text}");
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::QuestionReady(_) => println!(),
                SessionEvent::Error(message) => eprintln!("錯誤：{message}"),
                SessionEvent::Finished => {}
            }
        }
    });

    info!(base = %config.questionnaire_base, "starting questionnaire");
    session.start().await.context("Failed to start the questionnaire")?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let thresholds = HealthThresholds::default();

    loop {
        let state = session.snapshot().await;
        if state.finished() {
            print_results(&state);
            break;
        }
        let Some(question) = state.current_question.clone() else {
            // A stream failed; the session kept a retryable state.
            if !prompt_retry(&session, &mut input).await? {
                break;
            }
            continue;
        };

        match state.total_questions {
            Some(total) => println!("\n第 {} 題（共 {} 題）", state.question_index, total),
            None => println!("\n第 {} 題", state.question_index),
        }
        println!("{}", question.text);
        if let Some(reason) = question_health(&question, &thresholds) {
            println!("（題目可能不完整：{reason:?}；輸入 !r 可重新生成）");
        }
        match question.question_type {
            QuestionType::SingleChoice => {
                for (index, option) in question.options.iter().enumerate() {
                    println!("  {}. {}", index + 1, option);
                }
                println!("請輸入選項編號：");
            }
            QuestionType::Likert => println!("請輸入 1-5："),
            QuestionType::Open => println!("請輸入您的回答："),
        }
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = input.next_line().await? else {
            break;
        };
        let answer = line.trim();
        if answer == "!r" {
            let _ = session.regenerate().await;
            continue;
        }

        let draft = match question.question_type {
            QuestionType::SingleChoice => match answer.parse::<usize>() {
                Ok(choice) if (1..=question.options.len()).contains(&choice) => {
                    AnswerDraft::choice(choice - 1)
                }
                _ => {
                    println!("無效的選項編號");
                    continue;
                }
            },
            QuestionType::Likert => match answer.parse::<u8>() {
                Ok(value @ 1..=5) => AnswerDraft::likert(value),
                _ => {
                    println!("請輸入 1 到 5 之間的數字");
                    continue;
                }
            },
            QuestionType::Open => AnswerDraft::open(answer),
        };

        if let Err(e) = session.submit_answer(&draft).await {
            if !e.is_abort() {
                eprintln!("送出失敗：{e}（狀態已保留，可再試一次）");
            }
        }
    }

    printer.abort();
    Ok(())
}

/// Offers a retry after a failed question stream. Returns false to quit.
async fn prompt_retry(
    session: &QuestionnaireSession,
    input: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<bool> {
    print!("題目載入失敗，重試？(y/n) > ");
    let _ = std::io::stdout().flush();
    match input.next_line().await? {
        Some(line) if line.trim().eq_ignore_ascii_case("y") => {
            let _ = session.regenerate().await;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn print_results(state: &SessionState) {
    println!("\n=== 測驗完成 ===");
    if let Some(advice) = &state.advice {
        println!("建議：{advice}");
    }
    if let Some(analysis) = &state.analysis {
        println!("分析：{analysis}");
    }
    if let Some(profile) = &state.profile {
        println!(
            "風險 {} / 穩定 {} / 信心 {} / 耐心 {} / 敏感 {}",
            profile.risk, profile.stability, profile.confidence, profile.patience,
            profile.sensitivity
        );
        let investor_type = state
            .investor_type
            .clone()
            .unwrap_or_else(|| classify_investor(profile).to_string());
        println!("投資人類型：{investor_type}");
    }
    println!("共回答 {} 題", state.responses.len());
}

async fn run_insight(config: &Config, prompt: String, model: Option<String>) -> anyhow::Result<()> {
    let chat = Arc::new(HttpChatClient::new(&config.chat_url));
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let service = InsightService::new(chat, events_tx);

    let model = model.unwrap_or_else(|| config.chat_model.clone());
    info!(model = %model, url = %config.chat_url, "requesting analysis");
    service.request_analysis(ChatRequest::new(model, prompt)).await;

    // Updates carry the cumulative text; print only what is new.
    let mut printed = 0;
    while let Some(event) = events_rx.recv().await {
        match event {
            InsightEvent::Connecting => info!("connecting to model"),
            InsightEvent::Update(text) => {
                print!("{}", &text[printed..]);
                let _ = std::io::stdout().flush();
                printed = text.len();
            }
            InsightEvent::Completed(text) => {
                if text.len() > printed {
                    print!("{}", &text[printed..]);
                }
                println!();
                info!(chars = text.chars().count(), "analysis complete");
                break;
            }
            InsightEvent::Failed(message) => {
                service.shutdown().await;
                anyhow::bail!("analysis failed: {message}");
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
