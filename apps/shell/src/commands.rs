use crate::args::{ClearArgs, Command};
use anyhow::{Context, Result};
use qhub_domain::PrincipalKey;
use qhub_kernel::security::OriginGuard;
use qhub_quota::{CancellationToken, ClearTarget, OriginUsage, QuotaManager};
use tracing::{info, warn};

fn principal(raw: &str) -> Result<PrincipalKey> {
    OriginGuard::parse(raw).with_context(|| format!("'{raw}' is not a valid origin"))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_interrupt(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping usage enumeration");
            token.cancel();
        }
    });
}

fn print_rows(rows: &[OriginUsage]) {
    println!("{:<10} {:<48} {:>14} {:>9}", "REPOSITORY", "ORIGIN", "BYTES", "PERSISTED");
    for row in rows {
        println!(
            "{:<10} {:<48} {:>14} {:>9}",
            row.key.persistence,
            row.key.full_origin(),
            row.usage.total(),
            row.persisted
        );
    }
}

fn clear_target(args: ClearArgs) -> Result<ClearTarget> {
    Ok(match args {
        ClearArgs { origin: Some(origin), engine: Some(engine), persistence, .. } => {
            ClearTarget::Engine {
                principal: principal(&origin)?,
                persistence: persistence.map(Into::into),
                engine: engine.into(),
            }
        },
        ClearArgs { origin: Some(origin), persistence, .. } => {
            ClearTarget::Origin { principal: principal(&origin)?, persistence: persistence.map(Into::into) }
        },
        ClearArgs { prefix: Some(prefix), .. } => ClearTarget::Prefix(prefix),
        ClearArgs { private: true, .. } => ClearTarget::Private,
        _ => ClearTarget::All,
    })
}

pub(crate) async fn execute(manager: &QuotaManager, command: Command) -> Result<()> {
    match command {
        Command::Init {} => {
            manager.initialize_persistent_storage().await?;
            manager.initialize_temporary_storage().await?;
            println!(
                "Storage ready at {} ({} bytes of temporary usage)",
                manager.root().display(),
                manager.temporary_usage()
            );
        },
        Command::Usage { all } => {
            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);
            let rows = manager.get_usage(all, cancel).await?;
            print_rows(&rows);
        },
        Command::OriginUsage { origin } => {
            let usage = manager.get_origin_usage(principal(&origin)?, CancellationToken::new()).await?;
            for kind in qhub_domain::EngineKind::ALL {
                println!("{:<10} {:>14}", kind, usage.engine(kind));
            }
            println!("{:<10} {:>14}", "total", usage.total());
        },
        Command::Estimate { origin } => {
            let estimate = manager.estimate(principal(&origin)?).await?;
            println!("{} of {} bytes", estimate.usage, estimate.limit);
        },
        Command::Clear(args) => {
            let target = clear_target(args)?;
            let removed = manager.clear(target.clone()).await?;
            info!(%target, removed, "Clear finished");
            println!("{}", if removed { "Removed" } else { "Nothing to remove" });
        },
        Command::Persist { origin } => {
            let changed = manager.persist(principal(&origin)?).await?;
            println!("{}", if changed { "Persisted" } else { "Already persisted" });
        },
        Command::Evict { bytes } => {
            let freed = manager.evict(bytes).await?;
            println!("Freed {freed} bytes");
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Engine;
    use qhub_domain::{EngineKind, PersistenceKind};

    fn args() -> ClearArgs {
        ClearArgs { origin: None, prefix: None, private: false, all: false, persistence: None, engine: None }
    }

    #[test]
    fn engine_flag_narrows_an_origin_clear() {
        let target = clear_target(ClearArgs {
            origin: Some("https://A.com".to_owned()),
            engine: Some(Engine::Cache),
            ..args()
        })
        .expect("target");
        let ClearTarget::Engine { principal, persistence, engine } = target else {
            panic!("expected an engine target");
        };
        assert_eq!(principal.origin, "https://a.com");
        assert_eq!(persistence, None::<PersistenceKind>);
        assert_eq!(engine, EngineKind::Cache);
    }

    #[test]
    fn invalid_origins_are_reported() {
        let result = clear_target(ClearArgs { origin: Some("https://a.com/path".to_owned()), ..args() });
        assert!(result.is_err());
    }

    #[test]
    fn flags_map_to_targets() {
        assert!(matches!(clear_target(ClearArgs { private: true, ..args() }), Ok(ClearTarget::Private)));
        assert!(matches!(clear_target(ClearArgs { all: true, ..args() }), Ok(ClearTarget::All)));
        assert!(matches!(
            clear_target(ClearArgs { prefix: Some("https://a".to_owned()), ..args() }),
            Ok(ClearTarget::Prefix(_))
        ));
    }
}
