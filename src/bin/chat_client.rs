use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use tinychat::{
    client::{render_message, ChatSession, ClientError, HttpChatBackend, SamplingSettings, OPTIONS},
    config::ClientConfig,
    logging,
};

/// Terminal chat with the TinyLlama chat service.
#[derive(Parser, Debug)]
#[command(name = "tinychat-client", version)]
struct Args {
    /// Chat endpoint; defaults to LOCAL_API_URL or DOCKER_API_URL.
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Use greedy decoding instead of sampling.
    #[arg(long)]
    greedy: bool,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f64>,
}

impl Args {
    fn settings(&self) -> Result<SamplingSettings, ClientError> {
        let mut settings = SamplingSettings::default();
        if let Some(n) = self.max_new_tokens {
            settings.max_new_tokens = n;
        }
        if self.greedy {
            settings.do_sample = false;
        }
        if let Some(t) = self.temperature {
            settings.temperature = t;
        }
        if let Some(k) = self.top_k {
            settings.top_k = k;
        }
        if let Some(p) = self.top_p {
            settings.top_p = p;
        }
        settings.validate()?;
        Ok(settings)
    }
}

enum Command<'a> {
    Send(&'a str),
    NewChat,
    ShowConfig,
    Set(&'a str, &'a str),
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line);
    };
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("new"), None, None) => Command::NewChat,
        (Some("config"), None, None) => Command::ShowConfig,
        (Some("set"), Some(option), Some(value)) => Command::Set(option, value),
        (Some("help"), _, _) => Command::Help,
        (Some("quit") | Some("exit"), _, _) => Command::Quit,
        _ => Command::Unknown(line),
    }
}

fn print_help() {
    println!("Type a message and press enter to chat.");
    println!("  /new                    start a new chat and clear the history");
    println!("  /config                 show the current generation settings");
    println!("  /set <option> <value>   change a generation setting");
    println!("  /quit                   leave");
    println!("Options:");
    for doc in OPTIONS {
        println!("  {:<15} {}", doc.name, doc.effect);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init("warn");

    let args = Args::parse();
    let cfg = ClientConfig::from_env()?;
    let endpoint = args.url.clone().unwrap_or(cfg.api_url);
    info!(api_url = %endpoint, "API URL");

    let backend = HttpChatBackend::new(endpoint, cfg.service_token);
    let mut settings = args.settings()?;
    let mut session = ChatSession::new();

    println!("Chat with TinyLlama ({})", backend.endpoint());
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_command(&line) {
            Command::Send(text) => {
                // Input is not read again until this turn settles.
                let outcome = session
                    .send_message(&backend, &settings, text, |turn| {
                        println!("{}", render_message(turn));
                        println!("The assistant is thinking...");
                    })
                    .await;
                match outcome {
                    Ok(Some(reply)) => println!("{}", render_message(reply)),
                    Ok(None) => {}
                    Err(ClientError::Connection(_)) => println!("Failed to connect to the API"),
                    Err(_) => println!("Error in API request"),
                }
            }
            Command::NewChat => {
                session.new_chat();
                println!("Started a new chat.");
            }
            Command::ShowConfig => println!("{settings}"),
            Command::Set(option, value) => match settings.set(option, value) {
                Ok(()) => println!("{option} updated"),
                Err(err) => println!("{err}"),
            },
            Command::Help => print_help(),
            Command::Quit => break,
            Command::Unknown(raw) => println!("unknown command '{raw}', try /help"),
        }
    }

    Ok(())
}
