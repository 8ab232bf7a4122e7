// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Control lines
//!
//! The NCP is moved between its ROM bootloader and the application by
//! pulsing two active low signals, RESET and the bootloader backdoor pin.
//! They are reached either through the DTR/RTS lines of a local serial
//! port ([`crate::link::serial::SerialLink`]) or through HTTP requests to
//! the gateway or bridge exposing the NCP ([`HttpLines`]).

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{Error, Result};

/// Request timeout of [`HttpLines`].
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// Default local bridge address.
pub const DEFAULT_BRIDGE: &str = "127.0.0.1:8765";

/// Drives the RESET and bootloader signals.
#[async_trait]
pub trait ControlLines: Send + Sync {
    /// Set both signals, `true` pulls the line low.
    async fn set_lines(&self, rst_low: bool, bsl_low: bool) -> Result<()>;
}

#[async_trait]
impl<C> ControlLines for Arc<C>
where
    C: ControlLines + ?Sized,
{
    async fn set_lines(&self, rst_low: bool, bsl_low: bool) -> Result<()> {
        (**self).set_lines(rst_low, bsl_low).await
    }
}

/// One step of a control sequence: set the lines, then wait.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Step {
    pub rst_low: bool,
    pub bsl_low: bool,
    pub delay: Duration,
}

const fn step(rst_low: bool, bsl_low: bool, delay_ms: u64) -> Step {
    Step {
        rst_low,
        bsl_low,
        delay: Duration::from_millis(delay_ms),
    }
}

/// Reset with the bootloader pin held low, then release it.
pub const ENTER_BOOTLOADER: [Step; 4] = [
    step(true, true, 250),
    step(false, true, 250),
    step(false, false, 250),
    step(false, true, 500),
];

/// Pulse reset with the bootloader pin released.
pub const RESET_TO_APPLICATION: [Step; 3] = [
    step(true, true, 250),
    step(true, false, 250),
    step(true, true, 1000),
];

/// Plays the bootloader and reset sequences on a [`ControlLines`] driver.
///
/// Some boards wire DTR and RTS the other way around. When `swapped` is
/// set the two signals are exchanged before reaching the driver. A sequence
/// that fails is tried once more with the opposite setting, which is kept
/// if it works.
#[derive(Debug)]
pub struct Sequencer<C> {
    lines: C,
    swapped: bool,
}

impl<C> Sequencer<C>
where
    C: ControlLines,
{
    pub fn new(lines: C) -> Self {
        Sequencer {
            lines,
            swapped: false,
        }
    }

    pub fn swapped(mut self, swapped: bool) -> Self {
        self.swapped = swapped;
        self
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    pub fn lines(&self) -> &C {
        &self.lines
    }

    pub async fn enter_bootloader(&mut self) -> Result<()> {
        log::info!("entering bootloader");
        self.run("enter bootloader", &ENTER_BOOTLOADER).await
    }

    pub async fn reset_to_application(&mut self) -> Result<()> {
        log::info!("resetting to application");
        self.run("reset", &RESET_TO_APPLICATION).await
    }

    async fn run(&mut self, name: &str, steps: &[Step]) -> Result<()> {
        let e = match self.play(steps, self.swapped).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let swapped = !self.swapped;
        log::warn!(
            "{} failed: {}, retrying with {} lines",
            name,
            e,
            if swapped { "swapped" } else { "normal" }
        );
        self.play(steps, swapped).await?;
        self.swapped = swapped;

        Ok(())
    }

    async fn play(&self, steps: &[Step], swapped: bool) -> Result<()> {
        for step in steps {
            let (rst_low, bsl_low) = if swapped {
                (step.bsl_low, step.rst_low)
            } else {
                (step.rst_low, step.bsl_low)
            };

            self.lines.set_lines(rst_low, bsl_low).await?;
            tokio::time::sleep(step.delay).await;
        }

        Ok(())
    }
}

/// Values substituted in control URL templates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UrlContext {
    /// NCP host, `{HOST}`.
    pub host: String,
    /// NCP TCP port, `{PORT}`.
    pub port: u16,
    /// Bridge `host:port`, `{BRIDGE}`.
    pub bridge: String,
}

impl Default for UrlContext {
    fn default() -> Self {
        UrlContext {
            host: String::new(),
            port: 0,
            bridge: DEFAULT_BRIDGE.to_string(),
        }
    }
}

impl UrlContext {
    /// HTTP base URL of the bridge.
    pub fn bridge_base(&self) -> String {
        format!("http://{}", self.bridge)
    }
}

fn has_scheme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Expand a control URL template.
///
/// `{SET}` is replaced by `set` when given, `{PORT}`, `{HOST}` and
/// `{BRIDGE}` by `context`. A template without an `http(s)://` scheme is
/// resolved against the bridge when it refers to `{BRIDGE}` and against
/// the NCP host otherwise.
pub fn build_url(template: &str, set: Option<u32>, context: &UrlContext) -> Result<String> {
    let template = template.trim();
    if template.is_empty() {
        return Err(Error::InvalidUrl(template.to_string()));
    }

    let mut url = template.to_string();
    if let Some(set) = set {
        url = url.replace("{SET}", &set.to_string());
    }
    url = url
        .replace("{PORT}", &context.port.to_string())
        .replace("{HOST}", &context.host)
        .replace("{BRIDGE}", &context.bridge);

    if !has_scheme(&url) {
        url = if template.contains("{BRIDGE}") && url.starts_with(&context.bridge) {
            format!("http://{}", url)
        } else if template.contains("{BRIDGE}") {
            format!("{}/{}", context.bridge_base(), url.trim_start_matches('/'))
        } else {
            format!("http://{}/{}", context.host, url.trim_start_matches('/'))
        };
    }

    match reqwest::Url::parse(&url) {
        Ok(_) => Ok(url),
        Err(_) => Err(Error::InvalidUrl(url)),
    }
}

/// Control signal reached through [`HttpLines`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Line {
    Bsl,
    Rst,
}

/// Control lines driven by HTTP GET requests, one URL template per line.
///
/// `{SET}` carries the line level, `0` low and `1` high. The response body
/// is ignored, an HTTP error status fails the request.
#[derive(Debug, Clone)]
pub struct HttpLines {
    client: reqwest::Client,
    bsl: String,
    rst: String,
    baud: Option<String>,
    context: UrlContext,
}

impl HttpLines {
    pub fn new<B, R>(bsl: B, rst: R, context: UrlContext) -> Result<Self>
    where
        B: Into<String>,
        R: Into<String>,
    {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(HttpLines {
            client,
            bsl: bsl.into(),
            rst: rst.into(),
            baud: None,
            context,
        })
    }

    /// Lines described by `preset`.
    ///
    /// # Errors
    ///
    /// [`Error::Control`] if the preset has no RESET or bootloader template.
    pub fn from_preset(preset: &ControlPreset, context: UrlContext) -> Result<Self> {
        match (preset.bsl, preset.rst) {
            (Some(bsl), Some(rst)) => {
                let mut lines = HttpLines::new(bsl, rst, context)?;
                lines.baud = preset.baud.map(str::to_string);
                Ok(lines)
            }
            _ => Err(Error::Control(format!(
                "preset {} has no control line URLs",
                preset.name
            ))),
        }
    }

    /// Template used by [`HttpLines::set_baud`].
    pub fn with_baud<T: Into<String>>(mut self, template: T) -> Self {
        self.baud = Some(template.into());
        self
    }

    pub fn context(&self) -> &UrlContext {
        &self.context
    }

    async fn get(&self, template: &str, set: Option<u32>) -> Result<()> {
        let url = build_url(template, set, &self.context)?;
        log::debug!("CTRL(http): GET {}", url);

        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// Single request to the line endpoint, with `{SET}` = 1.
    ///
    /// Used with firmware that runs the whole pulse itself when its
    /// endpoint is hit.
    pub async fn trigger(&self, line: Line) -> Result<()> {
        let template = match line {
            Line::Bsl => &self.bsl,
            Line::Rst => &self.rst,
        };
        log::info!("CTRL(http): triggering {:?}", line);

        self.get(template, Some(1)).await
    }

    /// Ask the bridge to change the serial speed of the NCP port.
    pub async fn set_baud(&self, baud: u32) -> Result<()> {
        let template = self
            .baud
            .as_deref()
            .ok_or_else(|| Error::Control("no baud rate URL".to_string()))?;

        self.get(template, Some(baud)).await
    }
}

#[async_trait]
impl ControlLines for HttpLines {
    async fn set_lines(&self, rst_low: bool, bsl_low: bool) -> Result<()> {
        let (rst, bsl) = (u32::from(!rst_low), u32::from(!bsl_low));
        log::debug!("CTRL(http): RST={} BSL={}", rst, bsl);

        self.get(&self.bsl, Some(bsl)).await?;
        self.get(&self.rst, Some(rst)).await
    }
}

/// Known control line setups, selected by device type and protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ControlPreset {
    pub name: &'static str,
    /// The device runs the pulse itself, see [`HttpLines::trigger`].
    pub pin_mode: bool,
    pub bsl: Option<&'static str>,
    pub rst: Option<&'static str>,
    pub baud: Option<&'static str>,
    types: &'static [&'static str],
    protocol: Option<&'static str>,
}

pub static PRESETS: [ControlPreset; 4] = [
    ControlPreset {
        name: "ZigStar/UZG HTTP",
        pin_mode: true,
        bsl: Some("http://{HOST}/cmdZigBSL"),
        rst: Some("http://{HOST}/cmdZigRST"),
        baud: None,
        types: &["zigstar_gw", "zig_star_gw", "uzg-01", "xzg"],
        protocol: None,
    },
    ControlPreset {
        name: "TubesZB HTTP (ESPHome)",
        pin_mode: false,
        bsl: Some("http://{HOST}/switch/zBSL/{SET}"),
        rst: Some("http://{HOST}/switch/zRST_gpio/{SET}"),
        baud: None,
        types: &["tubeszb", "tubes_zb"],
        protocol: None,
    },
    ControlPreset {
        name: "Local USB via Bridge",
        pin_mode: false,
        bsl: Some("http://{BRIDGE}/sc?port={PORT}&dtr={SET}"),
        rst: Some("http://{BRIDGE}/sc?port={PORT}&rts={SET}"),
        baud: Some("http://{BRIDGE}/sc?port={PORT}&baud={SET}"),
        types: &["local"],
        protocol: Some("usb"),
    },
    ControlPreset {
        name: "Local Serial via Bridge",
        pin_mode: false,
        bsl: None,
        rst: None,
        baud: Some("http://{BRIDGE}/sc?port={PORT}&baud={SET}"),
        types: &["local"],
        protocol: Some("serial"),
    },
];

impl ControlPreset {
    /// First preset matching `device_type` and `protocol`, case insensitive.
    pub fn find(device_type: &str, protocol: &str) -> Option<&'static ControlPreset> {
        PRESETS.iter().find(|p| {
            p.types.iter().any(|t| t.eq_ignore_ascii_case(device_type))
                && p.protocol.map_or(true, |proto| proto.eq_ignore_ascii_case(protocol))
        })
    }
}
