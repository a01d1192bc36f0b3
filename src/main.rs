use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use rardirfs::config::Config;
use rardirfs::fs::Fs;

fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if config.enable_unrar {
        if let Err(err) = std::fs::create_dir_all(config.resolved_cache_dir()) {
            tracing::error!(%err, "failed to create extraction cache directory");
            std::process::exit(1);
        }
    }

    let options = vec![
        MountOption::RO,
        MountOption::FSName("rardirfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    let fs = Fs::new(&config);

    tracing::info!(
        source = %config.source_dir.display(),
        mountpoint = %config.mountpoint.display(),
        foreground = config.foreground,
        "mounting rardirfs",
    );

    let result = if config.foreground {
        fuser::mount2(fs, &config.mountpoint, &options)
    } else {
        match fuser::spawn_mount2(fs, &config.mountpoint, &options) {
            Ok(session) => {
                // Keep the background session alive for the process
                // lifetime; it unmounts on drop.
                std::mem::forget(session);
                loop {
                    std::thread::park();
                }
            }
            Err(err) => Err(err),
        }
    };

    if let Err(err) = result {
        tracing::error!(%err, "rardirfs exited with an error");
        std::process::exit(1);
    }
}
