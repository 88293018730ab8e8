use std::{fmt, io, path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use dialoguer::{Confirm, Input, theme::ColorfulTheme};
use ini::{Ini, Properties};
use tokio::fs;
use tracing::debug;

use crate::{
    constants::{self, DEFAULT_REFRESH_MARGIN, DEFAULT_SESSION_DURATION_SECS},
    error::{Error, Result},
    idp::{Factor, LoginCredentials},
    prompt::Prompter,
    secrets::SecretStore,
};

const MIN_SESSION_DURATION_SECS: i32 = 900;
const MAX_SESSION_DURATION_SECS: i32 = 43_200;

/// How the renewal daemon is scheduled after login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// No daemon; credentials simply expire.
    Off,
    /// Renew after the configured margin of each token's lifetime.
    #[default]
    Auto,
    /// As `Auto`, but never sleep longer than the given interval.
    Every(Duration),
}

impl RefreshMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RefreshMode::Off)
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            RefreshMode::Every(interval) => Some(*interval),
            _ => None,
        }
    }
}

impl FromStr for RefreshMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "no" => Ok(Self::Off),
            "auto" | "" | "0" => Ok(Self::Auto),
            secs => secs
                .parse::<u64>()
                .map(|secs| Self::Every(Duration::from_secs(secs)))
                .map_err(|_| {
                    Error::ConfigInvalid(format!(
                        "refresh must be off, auto or a number of seconds, got '{s}'"
                    ))
                }),
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshMode::Off => f.write_str("off"),
            RefreshMode::Auto => f.write_str("auto"),
            RefreshMode::Every(interval) => write!(f, "{}", interval.as_secs()),
        }
    }
}

/// Where the Duo factor comes from at login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorSetting {
    /// Ask every time; an empty answer sends no factor.
    #[default]
    Prompt,
    /// Never send a factor.
    Off,
    Fixed(Factor),
}

impl FactorSetting {
    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(Self::Prompt);
        }
        if value.eq_ignore_ascii_case("off") {
            return Ok(Self::Off);
        }
        value.parse().map(Self::Fixed)
    }

    fn as_config_value(&self) -> Option<&'static str> {
        match self {
            FactorSetting::Prompt => None,
            FactorSetting::Off => Some("off"),
            FactorSetting::Fixed(factor) => Some(factor.as_str()),
        }
    }
}

/// Per-profile login settings from `~/.aws-login/config`
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ecp_endpoint_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub factor: FactorSetting,
    pub passcode: Option<String>,
    pub role_arn: Option<String>,
    pub enable_keyring: bool,
    pub refresh: RefreshMode,
    pub refresh_margin: f64,
    pub duration_seconds: i32,
    pub ask_password: bool,
}

/// Command line values that take precedence over the profile
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub ecp_endpoint_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub factor: Option<String>,
    pub passcode: Option<String>,
    pub role_arn: Option<String>,
    pub refresh: Option<RefreshMode>,
    pub ask_password: bool,
}

impl Config {
    pub fn new(ecp_endpoint_url: impl Into<String>) -> Self {
        Self {
            ecp_endpoint_url: ecp_endpoint_url.into(),
            username: None,
            password: None,
            factor: FactorSetting::default(),
            passcode: None,
            role_arn: None,
            enable_keyring: false,
            refresh: RefreshMode::default(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            duration_seconds: DEFAULT_SESSION_DURATION_SECS,
            ask_password: false,
        }
    }

    fn from_ini_section(profile: &str, section: &Properties) -> Result<Self> {
        let text = |key: &str| {
            section
                .get(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let ecp_endpoint_url = text("ecp_endpoint_url").ok_or_else(|| {
            Error::ConfigInvalid(format!("profile '{profile}' is missing ecp_endpoint_url"))
        })?;

        let mut config = Self::new(ecp_endpoint_url);
        config.username = text("username");
        config.password = text("password");
        config.passcode = text("passcode");
        config.role_arn = text("role_arn");

        if let Some(factor) = text("factor") {
            config.factor = FactorSetting::parse(&factor)?;
        }
        if let Some(enabled) = text("enable_keyring") {
            config.enable_keyring = parse_bool("enable_keyring", &enabled)?;
        }
        if let Some(refresh) = text("refresh") {
            config.refresh = refresh.parse()?;
        }
        if let Some(margin) = text("refresh_margin") {
            config.refresh_margin = margin.parse().map_err(|_| {
                Error::ConfigInvalid(format!("refresh_margin must be a number, got '{margin}'"))
            })?;
        }
        if let Some(duration) = text("duration") {
            config.duration_seconds = parse_duration(&duration)?;
        }

        Ok(config)
    }

    fn save_to_ini(&self, ini: &mut Ini, profile: &str) {
        let optional = [
            ("username", self.username.as_deref()),
            ("password", self.password.as_deref()),
            ("factor", self.factor.as_config_value()),
            ("passcode", self.passcode.as_deref()),
            ("role_arn", self.role_arn.as_deref()),
        ];

        ini.with_section(Some(profile))
            .set("ecp_endpoint_url", &self.ecp_endpoint_url)
            .set("enable_keyring", self.enable_keyring.to_string())
            .set("refresh", self.refresh.to_string());

        for (key, value) in optional {
            match value {
                Some(value) => {
                    ini.with_section(Some(profile)).set(key, value);
                }
                None => {
                    ini.delete_from(Some(profile), key);
                }
            }
        }

        if self.refresh_margin != DEFAULT_REFRESH_MARGIN {
            ini.with_section(Some(profile))
                .set("refresh_margin", self.refresh_margin.to_string());
        }
        if self.duration_seconds != DEFAULT_SESSION_DURATION_SECS {
            ini.with_section(Some(profile))
                .set("duration", self.duration_seconds.to_string());
        }
    }

    /// Layer command line values over the profile.
    ///
    /// Asking for the password explicitly also bypasses the keyring.
    pub fn apply(mut self, overrides: Overrides) -> Result<Self> {
        if let Some(url) = overrides.ecp_endpoint_url {
            self.ecp_endpoint_url = url;
        }
        if let Some(username) = overrides.username {
            self.username = Some(username);
        }
        if let Some(password) = overrides.password {
            self.password = Some(password);
        }
        if let Some(factor) = overrides.factor {
            self.factor = FactorSetting::parse(&factor)?;
        }
        if let Some(passcode) = overrides.passcode {
            self.passcode = Some(passcode);
        }
        if let Some(role_arn) = overrides.role_arn {
            self.role_arn = Some(role_arn);
        }
        if let Some(refresh) = overrides.refresh {
            self.refresh = refresh;
        }
        if overrides.ask_password {
            self.ask_password = true;
            self.enable_keyring = false;
        }
        Ok(self)
    }

    /// Gather username, password and Duo factors, prompting for what is missing.
    pub fn get_credentials<P, K>(&self, prompter: &P, keyring: &K) -> Result<LoginCredentials>
    where
        P: Prompter + ?Sized,
        K: SecretStore + ?Sized,
    {
        let username = match &self.username {
            Some(username) => username.clone(),
            None => prompter.input("Username")?,
        };

        let password = if self.ask_password {
            prompter.password("Password")?
        } else if let Some(password) = &self.password {
            password.clone()
        } else if self.enable_keyring {
            match keyring.get_password(&username)? {
                Some(password) => password,
                None => prompter.password("Password")?,
            }
        } else {
            prompter.password("Password")?
        };

        if self.enable_keyring {
            keyring.set_password(&username, &password)?;
        }

        let factor = match self.factor {
            FactorSetting::Prompt => Factor::parse_optional(&prompter.input("Factor")?)?,
            FactorSetting::Off => None,
            FactorSetting::Fixed(factor) => Some(factor),
        };

        let passcode = match (factor, &self.passcode) {
            (Some(Factor::Passcode), Some(passcode)) => Some(passcode.clone()),
            (Some(Factor::Passcode), None) => Some(prompter.input("Code")?),
            _ => None,
        };

        debug!(username = %username, ?factor, "Gathered login credentials");
        Ok(LoginCredentials {
            username,
            password,
            factor,
            passcode,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "on" | "1" => Ok(true),
        "false" | "f" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::ConfigInvalid(format!(
            "{key} must be true or false, got '{value}'"
        ))),
    }
}

fn parse_duration(value: &str) -> Result<i32> {
    match value.trim().parse::<i32>() {
        Ok(secs) if (MIN_SESSION_DURATION_SECS..=MAX_SESSION_DURATION_SECS).contains(&secs) => {
            Ok(secs)
        }
        _ => Err(Error::ConfigInvalid(format!(
            "duration must be between {MIN_SESSION_DURATION_SECS} and {MAX_SESSION_DURATION_SECS} seconds, got '{value}'"
        ))),
    }
}

pub fn load_from(path: &Path, profile: &str) -> Result<Config> {
    let ini = match Ini::load_from_file(path) {
        Ok(ini) => ini,
        Err(ini::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::ConfigInvalid(format!(
                "no login configuration at {}; run `aws-login configure` first",
                path.display()
            )));
        }
        Err(ini::Error::Io(e)) => return Err(e.into()),
        Err(ini::Error::Parse(e)) => {
            return Err(Error::ConfigInvalid(format!(
                "failed to parse {}: {e}",
                path.display()
            )));
        }
    };

    let section = ini.section(Some(profile)).ok_or_else(|| {
        Error::ConfigInvalid(format!(
            "profile '{profile}' not found in {}",
            path.display()
        ))
    })?;

    Config::from_ini_section(profile, section)
}

pub async fn load(profile: &str) -> Result<Config> {
    let path = constants::get_login_config_path()
        .ok_or_else(|| Error::ConfigInvalid("cannot determine home directory".into()))?;
    load_from(&path, profile)
}

/// Write `config` into the profile's section, keeping other profiles intact.
pub async fn save_to(path: &Path, profile: &str, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Only a missing file starts from scratch
    let mut ini = match Ini::load_from_file(path) {
        Ok(ini) => ini,
        Err(ini::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ini::new(),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read existing config {}", path.display()));
        }
    };

    config.save_to_ini(&mut ini, profile);

    ini.write_to_file(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    Ok(())
}

pub async fn configure_interactive(path: &Path, profile: &str) -> anyhow::Result<()> {
    println!("Configuring aws-login for profile: {profile}");

    let existing = load_from(path, profile).ok();
    if existing.is_some() {
        println!("Press Enter to keep current values, or type new values.");
    }
    println!();

    let theme = ColorfulTheme::default();
    let current = existing.clone().unwrap_or_else(|| Config::new(""));

    let ecp_endpoint_url = Input::<String>::with_theme(&theme)
        .with_prompt("ECP Endpoint URL")
        .default(current.ecp_endpoint_url.clone())
        .allow_empty(!current.ecp_endpoint_url.is_empty())
        .validate_with(|input: &String| {
            if input.starts_with("https://") || input.starts_with("http://") {
                Ok(())
            } else {
                Err("ECP Endpoint URL must be an http(s) URL")
            }
        })
        .interact_text()
        .context("Failed to read ECP endpoint URL")?;

    let username = Input::<String>::with_theme(&theme)
        .with_prompt("Username")
        .default(current.username.clone().unwrap_or_default())
        .allow_empty(true)
        .interact_text()
        .context("Failed to read username")?;

    let enable_keyring = Confirm::with_theme(&theme)
        .with_prompt("Store password in the OS keyring?")
        .default(current.enable_keyring)
        .interact()
        .context("Failed to read keyring choice")?;

    let factor = Input::<String>::with_theme(&theme)
        .with_prompt("Duo Factor (auto, push, phone, sms, passcode, off; empty to ask)")
        .default(current.factor.as_config_value().unwrap_or_default().to_string())
        .allow_empty(true)
        .validate_with(|input: &String| {
            FactorSetting::parse(input)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read factor")?;

    let role_arn = Input::<String>::with_theme(&theme)
        .with_prompt("Role ARN (empty to choose at login)")
        .default(current.role_arn.clone().unwrap_or_default())
        .allow_empty(true)
        .validate_with(|input: &String| {
            if input.is_empty() || input.contains(":role/") {
                Ok(())
            } else {
                Err("Role ARN must look like arn:aws:iam::<account>:role/<name>")
            }
        })
        .interact_text()
        .context("Failed to read role ARN")?;

    let refresh = Input::<String>::with_theme(&theme)
        .with_prompt("Refresh (off, auto or seconds)")
        .default(current.refresh.to_string())
        .validate_with(|input: &String| {
            input
                .parse::<RefreshMode>()
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read refresh")?;

    let config = Config {
        ecp_endpoint_url,
        username: Some(username).filter(|u| !u.is_empty()),
        enable_keyring,
        factor: FactorSetting::parse(&factor)?,
        role_arn: Some(role_arn).filter(|r| !r.is_empty()),
        refresh: refresh.parse()?,
        ..current
    };

    if existing.as_ref() == Some(&config) {
        println!("\nNo changes made.");
        return Ok(());
    }

    save_to(path, profile, &config).await?;

    println!("\nConfiguration saved to {}.", path.display());
    Ok(())
}
