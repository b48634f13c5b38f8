//! Rank papers similar to an existing paper or a free-text query.

use anyhow::Result;
use clap::Parser;
use paperflow::db::{migrate, Db};
use paperflow::extract::OllamaExtractor;
use paperflow::{similarity, Config};
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "similar")]
#[command(about = "Find papers similar to a paper id or a free-text query")]
struct Args {
    /// Reference paper id
    #[arg(short, long, conflicts_with = "query")]
    paper: Option<String>,

    /// Free-text query
    #[arg(short, long)]
    query: Option<String>,

    /// Maximum number of results
    #[arg(short, long)]
    limit: Option<usize>,

    /// Minimum combined similarity score
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Weight of title similarity (abstract gets the rest)
    #[arg(long)]
    title_weight: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "warn")
    ).init();

    let args = Args::parse();

    let config = Config::load()?;
    let db = Db::new(config.db_path());
    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    let limit = args.limit.unwrap_or(config.similarity.default_limit);
    let threshold = args.threshold.unwrap_or(config.similarity.min_score);
    let title_weight = args.title_weight.unwrap_or(config.similarity.title_weight);
    let abstract_weight = 1.0 - title_weight;

    let results = match (&args.paper, &args.query) {
        (Some(id), _) => {
            similarity::similar_to_paper(&db, id, title_weight, abstract_weight, limit, threshold)
                .await?
        }
        (None, Some(query)) => {
            let extractor = OllamaExtractor::new(&config.extraction);
            similarity::similar_to_query(
                &db,
                &extractor,
                None,
                query,
                title_weight,
                abstract_weight,
                limit,
                threshold,
            )
            .await?
        }
        (None, None) => {
            anyhow::bail!("pass either --paper <id> or --query <text>");
        }
    };

    if results.is_empty() {
        println!("No similar papers at or above score {:.2}.", threshold);
        return Ok(());
    }

    for (rank, paper) in results.iter().enumerate() {
        println!(
            "{:>2}. {:.4}  {}  {}",
            rank + 1,
            paper.score,
            paper.id,
            paper.title.as_deref().unwrap_or("(untitled)")
        );
    }

    Ok(())
}
