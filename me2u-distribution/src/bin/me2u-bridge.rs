//! Peer-side probe for a swarm gateway, plus a demo gateway host.
//!
//! ```text
//! me2u-bridge <gateway-url> <doc-url>      print annotations and related peers, then leave
//! me2u-bridge serve <bind-addr> <doc-url>… host an in-memory gateway for the given docs
//! ```

use log::info;
use me2u_core::Document;
use me2u_distribution::{
    distribute_docs, DistributionConfig, DistributionContext, GatewayConfig, LocalDiscovery,
    MemoryCollection, MemoryStore, SwarmClient, SwarmServer, Verb,
};
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "usage: me2u-bridge <gateway-url> <doc-url>\n       me2u-bridge serve <bind-addr> <doc-url>...";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn probe(gateway_url: &str, doc_url: &str) -> Result<(), BoxError> {
    let client = SwarmClient::connect(gateway_url).await?;
    let channel = DistributionConfig::default().channel_for(doc_url);

    for path in ["/annotations.jsonld", "/related.json"] {
        let response = client.request(&channel, Verb::Get, path, None).await?;
        println!("{}", serde_json::to_string(&response)?);
    }

    println!("leaving swarm...");
    client.close().await;
    Ok(())
}

async fn serve(bind_addr: &str, docs: &[String]) -> Result<(), BoxError> {
    let server = SwarmServer::new(GatewayConfig {
        bind_addr: bind_addr.to_owned(),
        ..GatewayConfig::default()
    });
    let store = Arc::new(MemoryStore::new());
    let collection = Arc::new(MemoryCollection::new());
    for doc_url in docs {
        store.put(doc_url, Document::new(doc_url.clone())).await;
        collection.add(doc_url).await;
    }

    let ctx = DistributionContext::new(
        store,
        Arc::new(LocalDiscovery::new()),
        Arc::new(server.clone()),
    );
    let distribution = distribute_docs(collection, ctx).await;
    info!("Serving {} documents", distribution.registry().len().await);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let report = distribution.shutdown().await;
    info!(
        "Shut down {} distributors ({} failures)",
        report.destroyed,
        report.failures.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.as_slice() {
        [cmd, bind_addr, docs @ ..] if cmd == "serve" && !docs.is_empty() => {
            serve(bind_addr, docs).await
        }
        [gateway_url, doc_url] => probe(gateway_url, doc_url).await,
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
