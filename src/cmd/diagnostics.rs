//! Diagnostics command - runtime connectivity and host information

use anyhow::Result;
use sysinfo::System;

use devbench_daemon::config::Configuration;
use devbench_daemon::runtime::{ContainerRuntime, DockerRuntime, NAMESPACE_LABEL};

pub async fn run(config_path: &str) -> Result<()> {
    println!("devbenchd {}", env!("CARGO_PKG_VERSION"));

    match Configuration::load(config_path) {
        Ok(config) => {
            println!("config: {} (ok)", config_path);
            println!("  data directory: {}", config.system.data_directory.display());
            println!("  state database: {}", config.system.state_db_path.display());
            check_runtime(config.docker.socket_path.as_deref()).await;
        }
        Err(e) => {
            println!("config: {} ({})", config_path, e);
            check_runtime(None).await;
        }
    }

    let mut system = System::new_all();
    system.refresh_all();
    println!("host:");
    println!("  cpus: {}", system.cpus().len());
    println!(
        "  memory: {} MiB used / {} MiB total",
        system.used_memory() / 1024 / 1024,
        system.total_memory() / 1024 / 1024
    );

    Ok(())
}

async fn check_runtime(socket_path: Option<&str>) {
    let runtime = match socket_path {
        Some(socket) => DockerRuntime::connect_socket(socket),
        None => DockerRuntime::connect(),
    };

    match runtime {
        Ok(runtime) => match runtime.ping().await {
            Ok(()) => {
                println!("docker: reachable");
                let label = format!("{}=true", NAMESPACE_LABEL);
                match runtime.list_labeled(&label).await {
                    Ok(containers) => {
                        println!("  labeled containers: {}", containers.len());
                        for c in containers {
                            println!(
                                "    {} ({}, {})",
                                c.labeled_container_id().unwrap_or("<unlabeled>"),
                                c.image,
                                if c.running { "running" } else { "stopped" }
                            );
                        }
                    }
                    Err(e) => println!("  list failed: {}", e),
                }
            }
            Err(e) => println!("docker: unreachable ({})", e),
        },
        Err(e) => println!("docker: connection failed ({})", e),
    }
}
