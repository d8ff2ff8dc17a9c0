use crate::config::{Settings, TargetSettings};
use crate::error::Error;
use crate::proxy::{tracing_hooks, Proxy, Switch};
use crate::Result;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    proxy: Proxy,
}

impl Application {
    #[instrument]
    pub fn new() -> Result<Self> {
        Self::from_settings(Settings::new()?)
    }

    /// Build the proxy and its switches from loaded settings
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let proxy = Proxy::new(settings.proxy_config()?);

        match &settings.primary {
            Some(target) => proxy.primary(build_switch(target)?),
            None => warn!("No primary target configured; every request will get 503"),
        }

        let secondaries = settings
            .secondaries
            .iter()
            .map(build_switch)
            .collect::<Result<Vec<_>>>()?;
        proxy.add_secondary(secondaries);

        Ok(Self { settings, proxy })
    }

    /// Serve until Ctrl-C is received
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        info!(
            address = %self.settings.listen.address,
            secondaries = self.settings.secondaries.len(),
            "Starting switchproxy"
        );

        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(err) => warn!(error = %err, "Failed to listen for shutdown signal"),
            }
            proxy.stop();
        });

        self.proxy.start().await?;
        info!("Switchproxy stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

fn build_switch(target: &TargetSettings) -> Result<Switch> {
    let mut switch = Switch::with_timeout(&target.url, target.timeout())
        .map_err(|err| Error::invalid_target(&target.url, err))?;

    for rule in &target.rewrites {
        switch.rewrite(rule.from.as_str(), rule.to.as_str());
    }

    if target.log_calls {
        let (pre, post) = tracing_hooks();
        switch = switch.with_hooks(Some(pre), Some(post));
    }

    Ok(switch)
}
