//! Device discovery.
//!
//! Builders are registered with the [`Prober`], which walks them once at
//! server startup and collects every device they can produce. Hosts without
//! any discovery support surface [`ProberError::NotSupported`].

use std::sync::Arc;

use crate::Device;

#[derive(Debug, thiserror::Error)]
pub enum ProberError {
    #[error("this host does not support device discovery")]
    NotSupported,
    #[error("builder {name} failed: {source}")]
    Builder {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// One source of devices (a driver family).
pub trait DeviceBuilder: Send {
    fn name(&self) -> &'static str;

    /// Probes the host and opens every matching device.
    fn probe(&self) -> anyhow::Result<Vec<Arc<dyn Device>>>;
}

pub struct Prober {
    builders: Vec<Box<dyn DeviceBuilder>>,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// The default prober: the built-in sample driver set.
    pub fn with_default_builders() -> Self {
        let mut prober = Self::new();
        prober.register(Box::new(crate::sample::SampleBuilder::default()));
        prober
    }

    pub fn register(&mut self, builder: Box<dyn DeviceBuilder>) {
        log::debug!("registered device builder {}", builder.name());
        self.builders.push(builder);
    }

    /// Runs every builder and returns the combined device list.
    pub fn probe_all(&self) -> Result<Vec<Arc<dyn Device>>, ProberError> {
        if self.builders.is_empty() {
            return Err(ProberError::NotSupported);
        }

        let mut devices = Vec::new();
        for builder in &self.builders {
            let found = builder.probe().map_err(|source| ProberError::Builder {
                name: builder.name(),
                source,
            })?;
            log::info!("builder {} found {} device(s)", builder.name(), found.len());
            devices.extend(found);
        }
        Ok(devices)
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::with_default_builders()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prober_is_not_supported() {
        let prober = Prober::new();
        assert!(matches!(prober.probe_all(), Err(ProberError::NotSupported)));
    }

    #[test]
    fn default_prober_finds_the_sample_rig() {
        let devices = Prober::with_default_builders().probe_all().unwrap();
        // HMD plus two controllers.
        assert_eq!(devices.len(), 3);
    }
}
