use insureflow_db::{connect_with_config, migrations};

use crate::commands::{block_on, load_config, CommandResult};

pub fn run(status_only: bool) -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("migrate", async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let message = if status_only {
            let pending = migrations::pending_versions(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
            if pending.is_empty() {
                "no pending migrations".to_string()
            } else {
                let versions: Vec<String> = pending.iter().map(i64::to_string).collect();
                format!("pending migrations: {}", versions.join(", "))
            }
        } else {
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
            "applied pending migrations".to_string()
        };

        pool.close().await;
        Ok::<String, (&'static str, String, u8)>(message)
    });

    match result {
        Ok(Ok(message)) => CommandResult::success("migrate", message),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
        Err(failure) => failure,
    }
}
