use crate::{
    bootstrap,
    config::{Config, Layout},
    context::GlobalContext,
    display::{DisplayFailure, DisplaySupervisor, Readiness},
    identity::{RunIdentity, SessionEnv},
    launcher::Launcher,
    log_capability_snapshot,
    options::{self, OptionsPatch},
    render::ConfigDocument,
    secret::{SecretProvisioner, SessionSecret},
    staging,
};
use anyhow::{Context, Result};
use tracing::{debug, info};

/// The bootstrap sequence for one desktop session.
#[derive(Debug)]
pub struct Session {
    config: Config,
    context: GlobalContext,
}

impl Session {
    /// Create a new instance of `Session`
    pub fn new(config: Config) -> Result<Self> {
        let context = GlobalContext::detect().context("Failed to detect privilege level")?;

        info!(
            "Privilege level: {:?} (ruid {}, euid {}, egid {})",
            context.privilege_level(),
            context.ruid(),
            context.euid(),
            context.egid()
        );
        log_capability_snapshot!("startup capabilities");

        Ok(Self { config, context })
    }

    /// Runs every step in order. A successful run ends inside the gateway
    /// launcher, so this only returns when the display server failed.
    pub fn run(self) -> Result<DisplayFailure> {
        let config = &self.config;

        bootstrap::bootstrap(&self.context, config)?;

        let identity = RunIdentity::current()?;
        info!("Running as {} (uid {})", identity.username, identity.uid);

        let mut env = SessionEnv::capture();
        env.apply_identity(&identity);
        env.set_default("TZ", &config.general.timezone);

        let layout = Layout::new(&identity.home);

        let secret = SessionSecret::supplied_or_generate(config.display.password.as_deref())?;
        let secret_file = SecretProvisioner::new(layout.secret_file())?.provision(&secret, &env)?;
        if config.general.quiet_secret {
            info!("Display password is set");
        } else {
            info!("Display password is: {}", secret.expose());
        }

        let mut supervisor = DisplaySupervisor::from_config(config, &secret_file);
        supervisor.cleanup_stale()?;

        staging::stage_assets(&config.paths.conf_dir, &layout.jts_dir())?;
        let document =
            ConfigDocument::render(|key| config.gateway.lookup(key).or_else(|| env.get(key)));
        info!(
            "Trading mode: {}",
            document.get("TradingMode").unwrap_or_default()
        );
        document.write_to(&layout.ibc_config())?;

        let version = staging::resolve_version(&layout.jts_dir())?;
        options::patch_options(
            &layout.vm_options(&version),
            &OptionsPatch::container_memory(config.gateway.jvm_heap_size.as_deref()),
        )?;

        let readiness = supervisor.launch(&env)?;
        debug!("Display supervisor state: {:?}", supervisor.state());

        match readiness {
            Readiness::Ready(_display) => {
                match Launcher::new(config).handoff(&mut env, &version)? {}
            }
            Readiness::Failed(failure) => Ok(failure),
        }
    }
}
