use clap::Parser;
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    select, signal, spawn,
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use bytetide::{
    command::Command,
    config::Config,
    error::Error,
    node::{Node, NodeCtx, NodeMsg},
};

mod args;

use args::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not set the logger: {e}");
    }

    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    let node = match Node::new(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    let ctx = node.ctx.clone();
    let handle = spawn(node.run());

    // ctrl-c stops the node right away, even in the middle of a command
    {
        let cancel = ctx.cancel.clone();
        spawn(async move {
            select! {
                _ = cancel.cancelled() => {}
                _ = signal::ctrl_c() => cancel.cancel(),
            }
        });
    }

    if let Err(e) = read_commands(&ctx, ctx.cancel.clone()).await {
        error!("{e}");
    }

    match handle.await {
        Ok(Err(e)) => error!("{e}"),
        Err(e) => error!("{e}"),
        Ok(Ok(())) => {}
    }
}

/// Forward stdin lines to the node and print what it answers, until QUIT
/// or until the node stops.
async fn read_commands(
    ctx: &NodeCtx,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut lines = BufReader::new(stdin()).lines();

    loop {
        let line = select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };

        // stdin closed, the node keeps serving peers until interrupted
        let Some(line) = line else {
            cancel.cancelled().await;
            return Ok(());
        };

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(Error::InvalidCommand(msg)) => {
                println!("{msg}");
                continue;
            }
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        if command == Command::Quit {
            ctx.tx.send(NodeMsg::Quit).await?;
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        ctx.tx.send(NodeMsg::Command(command, tx)).await?;

        match rx.await {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => {}
            // the node stopped while running the command
            Err(_) => return Ok(()),
        }
    }
}
