use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley::agent::{ChatOrchestrator, ChatSettings, Outcome, Submission, SubmitOptions};
use parley::commands::{
    get_help_text, parse_slash_command, resolve_conversation, short_id, ParsedCommand, SlashCommand,
};
use parley::config::Config;
use parley::console::ConsoleSink;
use parley::events::{Conversation, ConversationSummary, Message, Role, UiEvent};
use parley::llm::{HttpTransport, RetryPolicy, RetryableTransport};
use parley::prompts::PromptLibrary;
use parley::session::ConversationStore;
use parley::storage::{FileStore, MemoryStore, SnapshotStore};

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Streaming chat with OpenAI-compatible models", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.parley/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model to use instead of the configured one
    #[arg(long, global = true)]
    model: Option<String>,

    /// Wait for complete answers instead of streaming
    #[arg(long, global = true)]
    no_stream: bool,

    /// Keep conversations in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat (default)
    Chat {
        /// Prompt template for the session
        #[arg(short, long)]
        template: Option<String>,
        /// Continue a conversation (number from `list` or id prefix)
        #[arg(short, long)]
        conversation: Option<String>,
    },
    /// List conversations, most recent first
    List,
    /// Print a conversation
    Show { conversation: String },
    /// Rename a conversation
    Rename { conversation: String, title: String },
    /// Delete a conversation
    Delete { conversation: String },
    /// List prompt templates
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(model) = cli.model.clone() {
        config.model = model;
    }
    if cli.no_stream {
        config.stream = false;
    }

    match cli.command.unwrap_or(Commands::Chat {
        template: None,
        conversation: None,
    }) {
        Commands::Chat {
            template,
            conversation,
        } => run_chat(config, cli.ephemeral, template, conversation).await,
        Commands::List => {
            let store = open_store(&config, cli.ephemeral)?;
            print_list(&store.list(), None);
            Ok(())
        }
        Commands::Show { conversation } => {
            let store = open_store(&config, cli.ephemeral)?;
            let id = lookup(&store.list(), &conversation)?;
            print_conversation(&store.get(&id)?);
            Ok(())
        }
        Commands::Rename {
            conversation,
            title,
        } => {
            let store = open_store(&config, cli.ephemeral)?;
            let id = lookup(&store.list(), &conversation)?;
            store.rename(&id, &title)?;
            println!("✏️  Renamed to \"{}\"", title.trim());
            Ok(())
        }
        Commands::Delete { conversation } => {
            let store = open_store(&config, cli.ephemeral)?;
            let id = lookup(&store.list(), &conversation)?;
            store.delete(&id)?;
            println!("🗑️  Deleted {}", id);
            Ok(())
        }
        Commands::Templates => {
            let prompts = PromptLibrary::load(&config.prompts_file(), &config.prompts_dir())?;
            print_templates(&prompts);
            Ok(())
        }
    }
}

fn open_store(config: &Config, ephemeral: bool) -> Result<ConversationStore> {
    let backend: Box<dyn SnapshotStore> = if ephemeral {
        Box::new(MemoryStore::new())
    } else {
        Box::new(FileStore::new(config.conversations_dir())?)
    };
    ConversationStore::open(backend).context("Failed to load conversations")
}

fn lookup(list: &[ConversationSummary], selector: &str) -> Result<String> {
    resolve_conversation(selector, list)
        .with_context(|| format!("No single conversation matches '{}'", selector))
}

async fn run_chat(
    config: Config,
    ephemeral: bool,
    template: Option<String>,
    conversation: Option<String>,
) -> Result<()> {
    let transport = HttpTransport::from_config(&config)?;
    let store = Arc::new(open_store(&config, ephemeral)?);
    let prompts = PromptLibrary::load(&config.prompts_file(), &config.prompts_dir())?;
    if let Some(name) = &template {
        prompts.get(name)?;
    }

    let (ui_tx, events) = mpsc::unbounded_channel();
    let chat = ChatOrchestrator::new(
        store,
        RetryableTransport::new(Arc::new(transport), RetryPolicy::from_config(&config)),
        prompts,
        ChatSettings::from_config(&config),
        ui_tx,
    );

    if let Some(selector) = conversation {
        let id = lookup(&chat.list(), &selector)?;
        print_conversation(&chat.switch_to(&id)?);
    }

    let mut repl = Repl {
        chat,
        sink: ConsoleSink::new(),
        events,
        options: SubmitOptions {
            template,
            ..SubmitOptions::default()
        },
    };
    repl.run().await
}

enum Flow {
    Continue,
    Exit,
    Submitted(Submission),
}

/// Interactive read-submit-render loop
struct Repl {
    chat: ChatOrchestrator,
    sink: ConsoleSink,
    events: mpsc::UnboundedReceiver<UiEvent>,
    options: SubmitOptions,
}

impl Repl {
    async fn run(&mut self) -> Result<()> {
        println!("💬 parley, model {}. Type /help for commands.", self.chat.settings().model);
        if let Some(active) = self.chat.active().and_then(|id| self.chat.conversation(&id).ok()) {
            println!("📂 {}", active.title);
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.sink.drain(&mut self.events);
            print!("\n> ");
            std::io::stdout().flush().context("Failed to flush stdout")?;

            let Some(line) = lines.next_line().await.context("Failed to read input")? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let flow = match parse_slash_command(line) {
                Some(parsed) => self.handle_command(&parsed),
                None if line.starts_with('/') => {
                    println!("Unknown command. Type /help for commands.");
                    Flow::Continue
                }
                None => match self.chat.submit(line, self.options.clone()) {
                    Ok(submission) => Flow::Submitted(submission),
                    Err(e) => {
                        println!("❌ {}", e);
                        Flow::Continue
                    }
                },
            };

            match flow {
                Flow::Continue => {}
                Flow::Exit => break,
                Flow::Submitted(submission) => self.follow(submission).await,
            }
        }

        println!("👋 Bye!");
        Ok(())
    }

    /// Render a submission until it ends; Ctrl-C cancels it
    async fn follow(&mut self, submission: Submission) {
        let id = submission.conversation_id().to_string();
        self.sink.take_last_error();
        let finished = submission.wait();
        tokio::pin!(finished);

        let outcome = loop {
            tokio::select! {
                outcome = &mut finished => break outcome,
                Some(event) = self.events.recv() => self.sink.show(&event),
                _ = tokio::signal::ctrl_c() => {
                    self.chat.cancel(&id);
                }
            }
        };
        // Events of the finished turn are queued before its outcome.
        self.sink.drain(&mut self.events);

        match outcome {
            Outcome::Cancelled => println!("\n⏹️  Cancelled"),
            Outcome::Failed(e) if self.sink.take_last_error().as_ref() != Some(&e) => {
                println!("❌ {}", e)
            }
            _ => {}
        }
    }

    fn active_or_report(&self) -> Option<String> {
        let active = self.chat.active();
        if active.is_none() {
            println!("No active conversation. Send a message or use /new.");
        }
        active
    }

    fn handle_command(&mut self, parsed: &ParsedCommand) -> Flow {
        match self.try_command(parsed) {
            Ok(flow) => flow,
            Err(e) => {
                println!("❌ {}", e);
                Flow::Continue
            }
        }
    }

    fn try_command(&mut self, parsed: &ParsedCommand) -> Result<Flow> {
        match parsed.command {
            SlashCommand::New => {
                let conversation = self.chat.new_conversation(parsed.argument())?;
                println!("🆕 {}", conversation.title);
            }
            SlashCommand::List => print_list(&self.chat.list(), self.chat.active().as_deref()),
            SlashCommand::Switch => {
                let selector = parsed.argument().context("Usage: /switch <number|id>")?;
                let id = lookup(&self.chat.list(), selector)?;
                print_conversation(&self.chat.switch_to(&id)?);
            }
            SlashCommand::Rename => {
                let title = parsed.argument().context("Usage: /rename <title>")?;
                if let Some(id) = self.active_or_report() {
                    self.chat.rename(&id, title)?;
                    println!("✏️  Renamed to \"{}\"", title);
                }
            }
            SlashCommand::Delete => {
                let id = match parsed.argument() {
                    Some(selector) => lookup(&self.chat.list(), selector)?,
                    None => match self.active_or_report() {
                        Some(id) => id,
                        None => return Ok(Flow::Continue),
                    },
                };
                self.chat.delete(&id)?;
                println!("🗑️  Deleted");
            }
            SlashCommand::History => {
                if let Some(id) = self.active_or_report() {
                    print_conversation(&self.chat.conversation(&id)?);
                }
            }
            SlashCommand::Template => {
                let name = parsed.argument().context("Usage: /template <name>")?;
                self.chat.prompts().get(name)?;
                self.options.template = Some(name.to_string());
                println!("📝 Using template {}", name);
            }
            SlashCommand::Templates => print_templates(self.chat.prompts()),
            SlashCommand::Stream => {
                let current = self.options.stream.unwrap_or(self.chat.settings().stream);
                let stream = parsed
                    .stream_setting(current)
                    .context("Usage: /stream [on|off]")?;
                self.options.stream = Some(stream);
                println!("Streaming {}", if stream { "on" } else { "off" });
            }
            SlashCommand::Retry => {
                if let Some(id) = self.active_or_report() {
                    let submission = self.chat.regenerate(&id, self.options.clone())?;
                    return Ok(Flow::Submitted(submission));
                }
            }
            SlashCommand::Edit => {
                let text = parsed.argument().context("Usage: /edit <message>")?;
                if let Some(id) = self.active_or_report() {
                    let submission = self.chat.edit_last(&id, text, self.options.clone())?;
                    return Ok(Flow::Submitted(submission));
                }
            }
            SlashCommand::Undo => {
                if let Some(id) = self.active_or_report() {
                    match self.chat.undo(&id)? {
                        Some(message) => println!("↩️  Removed {} message", message.role),
                        None => println!("Nothing to undo"),
                    }
                }
            }
            SlashCommand::Like | SlashCommand::Dislike => {
                if let (Some(id), Some(feedback)) = (self.active_or_report(), parsed.feedback()) {
                    self.chat.rate(&id, feedback)?;
                    println!("Thanks for the feedback");
                }
            }
            SlashCommand::Help => println!("{}", get_help_text()),
            SlashCommand::Bye => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }
}

fn print_list(list: &[ConversationSummary], active: Option<&str>) {
    if list.is_empty() {
        println!("📭 No conversations yet. Run 'parley' to start one!");
        return;
    }
    for (index, summary) in list.iter().enumerate() {
        let marker = if active == Some(summary.id.as_str()) { "*" } else { " " };
        println!(
            "{}{:>3}. {}  ({} messages, 👍{} 👎{}, {})  {}",
            marker,
            index + 1,
            summary.title,
            summary.message_count,
            summary.likes,
            summary.dislikes,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            short_id(&summary.id),
        );
    }
}

fn print_conversation(conversation: &Conversation) {
    println!("📂 {}", conversation.title);
    for message in &conversation.messages {
        print_message(message);
    }
}

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "👤 You",
        Role::Assistant => "🤖 Assistant",
        Role::System => "⚙️  System",
    };
    let suffix = if message.incomplete { " (incomplete)" } else { "" };
    println!("\n{}{}:", label, suffix);
    if let Some(thinking) = &message.thinking {
        println!("💭 {}", thinking);
    }
    println!("{}", message.content);
}

fn print_templates(prompts: &PromptLibrary) {
    for template in prompts.templates() {
        println!("• {}  {}", template.name, template.description);
    }
}
