//! kanban-sync: command-line client for a shared task board
//!
//! Thin shell over the library: every command builds a [`SyncContext`] from
//! the config file and CLI overrides, performs one action, and prints the
//! result. `watch` keeps the push channel open and prints the board on every
//! change until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use kanban_sync::{Board, Config, MoveOutcome, NewBoard, NewCard, Priority, SyncContext, SyncError};

#[derive(Parser)]
#[command(name = "kanban-sync")]
#[command(about = "Keep a local view of a shared task board in sync")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "kanban-sync.toml")]
    config: PathBuf,

    /// API base URL (overrides config file)
    #[arg(long, env = "KANBAN_API_URL")]
    api_url: Option<String>,

    /// Push channel URL (overrides config file)
    #[arg(long, env = "KANBAN_WS_URL")]
    ws_url: Option<String>,

    /// File holding the persisted session (overrides config file)
    #[arg(long, env = "KANBAN_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and persist the session
    Login { email: String, password: String },
    /// Forget the persisted session
    Logout,
    /// List boards visible to the current user
    Boards,
    /// Create a board
    CreateBoard {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Print a board with its columns and cards
    Show { board: String },
    /// Print cards whose title or description matches a term
    Search { board: String, term: String },
    /// Create a card in a column
    CreateCard {
        board: String,
        column: String,
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: Priority,
    },
    /// Delete a card
    DeleteCard { board: String, card: String },
    /// Move a card to another column
    Move {
        board: String,
        card: String,
        column: String,
    },
    /// Follow a board's live changes until interrupted
    Watch { board: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kanban_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(api_url) = cli.api_url {
        config.api.base_url = api_url;
    }
    if let Some(ws_url) = cli.ws_url {
        config.realtime.ws_url = ws_url;
    }
    if let Some(token_file) = cli.token_file {
        config.session.token_file = token_file;
    }
    info!(api = %config.api.base_url, "Using board API");

    let ctx = SyncContext::from_config(&config)?;

    match run(&ctx, cli.command).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.requires_login() => {
            eprintln!("Session expired, run `kanban-sync login` again");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(ctx: &SyncContext, command: Command) -> Result<(), SyncError> {
    match command {
        Command::Login { email, password } => {
            ctx.gateway.login(&email, &password).await?;
            println!("Logged in as {}", email);
        }
        Command::Logout => {
            ctx.gateway.logout();
            println!("Logged out");
        }
        Command::Boards => {
            for board in ctx.gateway.list_boards().await? {
                println!("{}\t{}", board.id, board.name);
            }
        }
        Command::CreateBoard { name, description } => {
            let board = ctx
                .gateway
                .create_board(&NewBoard { name, description })
                .await?;
            println!("Created board {} ({})", board.name, board.id);
        }
        Command::Show { board } => {
            let board = ctx.reconciler.load_board(&board).await?;
            print_board(&board);
        }
        Command::Search { board, term } => {
            ctx.reconciler.load_board(&board).await?;
            for card in ctx.reconciler.filter_cards(&term).await {
                println!("{}\t{}\t{}", card.id, card.column_id, card.title);
            }
        }
        Command::CreateCard {
            board,
            column,
            title,
            description,
            priority,
        } => {
            ctx.reconciler.load_board(&board).await?;
            let card = ctx
                .reconciler
                .create_card(&NewCard {
                    title,
                    description,
                    priority,
                    column_id: column,
                    board_id: board,
                })
                .await?;
            println!("Created card {} in column {}", card.id, card.column_id);
        }
        Command::DeleteCard { board, card } => {
            ctx.reconciler.load_board(&board).await?;
            ctx.reconciler.delete_card(&card).await?;
            println!("Deleted card {}", card);
        }
        Command::Move {
            board,
            card,
            column,
        } => {
            ctx.reconciler.load_board(&board).await?;
            match ctx.mover.move_card(&card, &column).await? {
                MoveOutcome::Moved(_) => println!("Moved {} to {}", card, column),
                MoveOutcome::Unchanged => println!("{} is already in {}", card, column),
            }
        }
        Command::Watch { board } => watch(ctx, &board).await?,
    }
    Ok(())
}

async fn watch(ctx: &SyncContext, board_id: &str) -> Result<(), SyncError> {
    if !ctx.session.is_authenticated() {
        return Err(SyncError::SessionExpired);
    }

    let board = ctx.reconciler.load_board(board_id).await?;
    print_board(&board);

    let mut changes = ctx.reconciler.subscribe_changes();
    changes.borrow_and_update();
    let mut auth = ctx.session.subscribe();
    let (runner, follower) = ctx.start_realtime();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(board) = ctx.reconciler.snapshot().await {
                    print_board(&board);
                }
            }
            _ = auth.changed() => {
                let logged_in = *auth.borrow();
                if !logged_in {
                    warn!("Session ended while watching");
                    break;
                }
            }
        }
    }

    ctx.channel.shutdown();
    follower.abort();
    let _ = runner.await;

    if ctx.session.is_authenticated() {
        Ok(())
    } else {
        Err(SyncError::SessionExpired)
    }
}

fn print_board(board: &Board) {
    println!("== {} ({})", board.name, board.id);
    for column in &board.columns {
        println!("[{}] {}", column.id, column.name);
        for card in &column.cards {
            println!("  - {} [{}] {}", card.id, card.priority, card.title);
        }
    }
}
