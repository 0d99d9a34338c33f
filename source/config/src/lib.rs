//! # AXI DMA proxy configuration
//!
//! Platform crates describe their engine in a TOML file, which is turned into
//! a compact postcard blob at build time and baked into the binary.
//!
//! ## In a `build.rs` script
//!
//! ```toml
//! [build-dependencies]
//! axi-dma-proxy-config = { path = "../../source/config", features = ["use-std"] }
//! ```
//!
//! ```rust,ignore
//! # #![allow(clippy::needless_doctest_main, non_camel_case_types)]
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct YOUR_PLATFORM_CONFIG(u8);
//! use dma_proxy_config::buildtime::render_file;
//! fn main() {
//!     render_file::<YOUR_PLATFORM_CONFIG>("zynq.toml").unwrap();
//! }
//! ```
//!
//! ## At runtime
//!
//! ```rust,ignore
//! # #![allow(non_camel_case_types)]
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct YOUR_PLATFORM_CONFIG(u8);
//! let config = dma_proxy_config::include_config!(YOUR_PLATFORM_CONFIG).unwrap();
//! let engine = dma_proxy::Engine::attach(regs, allocator, spawner, config.proxy)?;
//! ```
//!
//! A TOML file only needs to name the settings it changes:
//!
//! ```toml
//! [proxy]
//! max_sessions = 2
//! rx_poll = { max_polls = 100000 }
//!
//! [platform]
//! # ...
//! ```

#![cfg_attr(not(any(feature = "use-std", test)), no_std)]

use dma_proxy::ProxySettings;
use serde::{Deserialize, Serialize};

/// The top level configuration type, generic over the platform's own
/// settings.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DmaProxyConfig<Platform> {
    #[serde(default)]
    pub proxy: ProxySettings,
    pub platform: Platform,
}

pub const CONFIG_FILE_VAR: &str = "DMA_PROXY_CONFIG";

/// Tools for build.rs scripts.
#[cfg(feature = "use-std")]
pub mod buildtime {
    const OUT_DIR: &str = "OUT_DIR";
    const TAG: &str = concat!(module_path!(), ":");

    use std::{env, fs, path::Path};

    use super::*;
    use miette::{Context, IntoDiagnostic, Result};
    use serde::de::DeserializeOwned;

    /// Parses and checks a TOML configuration.
    pub fn from_toml<Platform>(s: &str) -> Result<DmaProxyConfig<Platform>>
    where
        Platform: DeserializeOwned + 'static,
    {
        let cfg: DmaProxyConfig<Platform> = toml::from_str(s).into_diagnostic()?;
        cfg.proxy
            .validate()
            .map_err(|error| miette::miette!("invalid proxy settings: {error}"))?;
        Ok(cfg)
    }

    /// Renders the configuration file at `path` into `OUT_DIR`, where
    /// [`include_config!()`] picks it up.
    pub fn render_file<Platform>(path: impl AsRef<Path>) -> Result<()>
    where
        Platform: Serialize + DeserializeOwned + 'static,
    {
        let out_dir = env::var(OUT_DIR)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read '{OUT_DIR}' env variable"))?;
        let path = path.as_ref();
        let path_disp = path.display();
        eprintln!("{TAG} rendering '{path_disp}' into {OUT_DIR}='{out_dir}'");

        (|| {
            let filename = path
                .file_name()
                .ok_or_else(|| miette::miette!("Path has no filename!"))?;
            let cfg = fs::read_to_string(path).into_diagnostic()?;
            let cfg = from_toml::<Platform>(&cfg)?;

            let mut out = Path::new(&out_dir).join(filename);
            out.set_extension("postcard");
            let bin = postcard::to_stdvec(&cfg).into_diagnostic()?;
            fs::write(&out, bin).into_diagnostic()?;
            println!("cargo:rustc-env={CONFIG_FILE_VAR}={}", out.display());
            println!("cargo:rerun-if-changed={path_disp}");

            Ok::<_, miette::Report>(())
        })()
        .wrap_err_with(|| format!("Failed to render config file '{path_disp}'"))
    }
}

/// Tools for use at runtime.
pub mod runtime {
    use crate::DmaProxyConfig;
    use serde::de::DeserializeOwned;

    #[derive(Debug, PartialEq)]
    pub enum Error {
        Postcard(postcard::Error),
        Settings(dma_proxy::Error),
    }

    pub fn from_postcard<Platform>(s: &[u8]) -> Result<DmaProxyConfig<Platform>, Error>
    where
        Platform: DeserializeOwned + 'static,
    {
        let cfg: DmaProxyConfig<Platform> = postcard::from_bytes(s).map_err(Error::Postcard)?;
        cfg.proxy.validate().map_err(Error::Settings)?;
        Ok(cfg)
    }
}

/// Loads the configuration rendered by [`buildtime::render_file`] in a
/// build.rs.
#[macro_export]
macro_rules! include_config {
    ($platform: ty) => {{
        const DMA_PROXY_CONFIG: &[u8] = include_bytes!(env!("DMA_PROXY_CONFIG"));
        $crate::runtime::from_postcard::<$platform>(DMA_PROXY_CONFIG)
    }};
}
