use chrono::TimeDelta;
use clap::Parser;
use esm_broker::kite::KiteWebLogin;
use esm_broker::{DryRunBroker, DynBroker, KiteBroker, KiteEnv, LoginCredentials};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

use crate::compliance::MarketOrderRestriction;
use crate::execution::ExecutionConfig;
use crate::scheduler::{RunMode, ScheduleConfig, SchedulerError};
use crate::token::AutoLogin;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct LoginEnv {
    /// Obtain tokens by driving the web login when the stored one is rejected
    #[clap(long, env, default_value = "false")]
    pub auto_login: bool,
    #[clap(long, env)]
    pub login_user_id: Option<String>,
    #[clap(long, env)]
    pub login_password: Option<String>,
    /// Account PIN or TOTP code used as the second factor
    #[clap(long, env)]
    pub login_pin: Option<String>,
    /// Upper bound for the whole automated login, in seconds
    #[clap(long, env, default_value = "60")]
    pub login_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Automated login is enabled but {0} is not set")]
    MissingLoginField(&'static str),
    #[error("Invalid market order restriction: {0}")]
    MarketOrderRestriction(#[from] esm_broker::InvalidSymbolError),
    #[error(transparent)]
    Schedule(#[from] SchedulerError),
    #[error("Login client setup failed: {0}")]
    Login(#[from] esm_broker::LoginError),
    #[error("Broker client setup failed: {0}")]
    Broker(#[from] esm_broker::BrokerError),
}

impl LoginEnv {
    pub fn credentials(&self) -> Result<Option<LoginCredentials>, ConfigError> {
        if !self.auto_login {
            return Ok(None);
        }

        let require = |value: &Option<String>, name: &'static str| {
            value
                .clone()
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::MissingLoginField(name))
        };

        Ok(Some(LoginCredentials {
            user_id: require(&self.login_user_id, "LOGIN_USER_ID")?,
            password: require(&self.login_password, "LOGIN_PASSWORD")?,
            pin: require(&self.login_pin, "LOGIN_PIN")?,
        }))
    }

    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ExecutionEnv {
    /// Placement attempts per order, the first one included
    #[clap(long, env, default_value = "3")]
    pub max_attempts: usize,
    /// Delay before the first retry; doubles on every further retry
    #[clap(long, env, default_value = "1000")]
    pub retry_backoff_ms: u64,
    #[clap(long, env, default_value = "4")]
    pub max_concurrency: usize,
    /// Compare required margin against available cash before each placement
    #[clap(long, env, default_value = "false")]
    pub margin_check: bool,
    /// `all`, `none`, or a comma separated list such as `NSE:INFY,BSE:TCS`
    #[clap(long, env, default_value = "all")]
    pub market_order_restriction: String,
}

impl ExecutionEnv {
    pub fn execution_config(&self, call_timeout: Duration) -> ExecutionConfig {
        ExecutionConfig {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
            max_concurrency: self.max_concurrency.max(1),
            call_timeout,
            margin_check: self.margin_check,
        }
    }

    pub fn restriction(&self) -> Result<MarketOrderRestriction, ConfigError> {
        Ok(self.market_order_restriction.parse()?)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ScheduleEnv {
    /// Local wall-clock time of the daily firing, HH:MM
    #[clap(long, env, default_value = "09:30")]
    pub fire_at: String,
    #[clap(long, env, default_value = "Asia/Kolkata")]
    pub timezone: String,
    /// How late, in seconds, a start may be and still fire today
    #[clap(long, env, default_value = "0")]
    pub missed_fire_tolerance_secs: i64,
    #[clap(long, env, default_value = "true", action = clap::ArgAction::Set)]
    pub skip_weekends: bool,
}

impl ScheduleEnv {
    pub fn schedule_config(&self) -> Result<ScheduleConfig, SchedulerError> {
        ScheduleConfig::parse(
            &self.fire_at,
            &self.timezone,
            TimeDelta::seconds(self.missed_fire_tolerance_secs.max(0)),
            self.skip_weekends,
        )
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    pub database_url: String,
    #[clap(long, env, default_value = "debug")]
    pub log_level: LogLevel,
    #[clap(flatten)]
    pub kite: KiteEnv,
    #[clap(flatten)]
    pub login: LoginEnv,
    #[clap(flatten)]
    pub execution: ExecutionEnv,
    #[clap(flatten)]
    pub schedule: ScheduleEnv,
    /// CSV with columns trading_symbol, quantity, order_type, limit_price, is_active
    #[clap(long, env, default_value = "config/stocks.csv")]
    pub stocks_csv: PathBuf,
    /// Fire once right away instead of waiting for the daily time
    #[clap(long, env, default_value = "false")]
    pub run_now: bool,
    /// One-time request token to exchange on the next acquisition
    #[clap(long, env)]
    pub request_token: Option<String>,
    #[clap(long, env, default_value = "false")]
    pub dry_run: bool,
}

impl Env {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePool::connect(&self.database_url).await
    }

    pub const fn run_mode(&self) -> RunMode {
        if self.run_now {
            RunMode::Immediate
        } else {
            RunMode::Scheduled
        }
    }

    pub fn get_broker(&self) -> Result<DynBroker, ConfigError> {
        if self.dry_run {
            Ok(Arc::new(DryRunBroker::new()))
        } else {
            Ok(Arc::new(KiteBroker::new(&self.kite)?))
        }
    }

    pub fn auto_login(&self) -> Result<Option<AutoLogin>, ConfigError> {
        let Some(credentials) = self.login.credentials()? else {
            return Ok(None);
        };

        let automator = KiteWebLogin::new(&self.kite.web_base_url, self.kite.request_timeout())?;

        Ok(Some(AutoLogin {
            automator: Arc::new(automator),
            credentials,
        }))
    }
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter =
        format!("esm_trader={level},esm_broker={level},esm_auth={level},main={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .compact()
        .init();
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::NaiveTime;
    use esm_broker::{SupportedBroker, Symbol};

    pub fn create_test_env() -> Env {
        Env {
            database_url: ":memory:".to_string(),
            log_level: LogLevel::Debug,
            kite: KiteEnv {
                api_key: "test_api_key".to_string(),
                api_secret: "test_api_secret".to_string(),
                api_base_url: "https://api.kite.test".to_string(),
                web_base_url: "https://kite.test".to_string(),
                request_timeout_secs: 10,
            },
            login: LoginEnv {
                auto_login: false,
                login_user_id: None,
                login_password: None,
                login_pin: None,
                login_timeout_secs: 60,
            },
            execution: ExecutionEnv {
                max_attempts: 3,
                retry_backoff_ms: 1000,
                max_concurrency: 4,
                margin_check: false,
                market_order_restriction: "all".to_string(),
            },
            schedule: ScheduleEnv {
                fire_at: "09:30".to_string(),
                timezone: "Asia/Kolkata".to_string(),
                missed_fire_tolerance_secs: 0,
                skip_weekends: true,
            },
            stocks_csv: PathBuf::from("config/stocks.csv"),
            run_now: false,
            request_token: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_log_level_from_conversion() {
        let level: Level = LogLevel::Trace.into();
        assert_eq!(Level::TRACE, level);

        let level: Level = LogLevel::Info.into();
        assert_eq!(Level::INFO, level);

        let log_level = LogLevel::Error;
        let level: Level = (&log_level).into();
        assert_eq!(level, Level::ERROR);
    }

    #[test]
    fn test_parse_defaults_from_args() {
        let env = Env::try_parse_from([
            "esm-trader",
            "--db",
            "sqlite::memory:",
            "--api-key",
            "key",
            "--api-secret",
            "secret",
        ])
        .unwrap();

        assert_eq!(env.kite.api_base_url, "https://api.kite.trade");
        assert_eq!(env.execution.max_attempts, 3);
        assert_eq!(env.schedule.fire_at, "09:30");
        assert!(env.schedule.skip_weekends);
        assert!(!env.login.auto_login);
        assert_eq!(env.run_mode(), RunMode::Scheduled);
    }

    #[test]
    fn test_run_now_selects_immediate_mode() {
        let mut env = create_test_env();
        env.run_now = true;
        assert_eq!(env.run_mode(), RunMode::Immediate);
    }

    #[tokio::test]
    async fn test_env_sqlite_pool_creation() {
        let env = create_test_env();
        assert!(env.get_sqlite_pool().await.is_ok());
    }

    #[test]
    fn test_get_broker_dry_run_modes() {
        let mut env = create_test_env();
        let broker = env.get_broker().unwrap();
        assert_eq!(broker.to_supported_broker(), SupportedBroker::Kite);

        env.dry_run = true;
        let broker = env.get_broker().unwrap();
        assert_eq!(broker.to_supported_broker(), SupportedBroker::DryRun);
    }

    #[test]
    fn test_login_credentials_required_when_enabled() {
        let mut env = create_test_env();
        assert!(env.login.credentials().unwrap().is_none());
        assert!(env.auto_login().unwrap().is_none());

        env.login.auto_login = true;
        env.login.login_user_id = Some("AB1234".to_string());
        env.login.login_password = Some("password".to_string());
        assert!(matches!(
            env.login.credentials().unwrap_err(),
            ConfigError::MissingLoginField("LOGIN_PIN")
        ));

        env.login.login_pin = Some("123456".to_string());
        let credentials = env.login.credentials().unwrap().unwrap();
        assert_eq!(credentials.user_id, "AB1234");
        assert!(env.auto_login().unwrap().is_some());
    }

    #[test]
    fn test_execution_config_from_env() {
        let env = create_test_env();
        let config = env.execution.execution_config(Duration::from_secs(5));

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, Duration::from_secs(1));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert!(!config.margin_check);
        assert_eq!(
            env.execution.restriction().unwrap(),
            MarketOrderRestriction::All
        );
    }

    #[test]
    fn test_restriction_symbol_list() {
        let mut env = create_test_env();
        env.execution.market_order_restriction = "NSE:INFY, BSE:TCS".to_string();

        let MarketOrderRestriction::Symbols(symbols) = env.execution.restriction().unwrap() else {
            panic!("expected symbol list");
        };
        assert!(symbols.contains(&"NSE:INFY".parse::<Symbol>().unwrap()));
        assert_eq!(symbols.len(), 2);

        env.execution.market_order_restriction = "INFY".to_string();
        assert!(env.execution.restriction().is_err());
    }

    #[test]
    fn test_schedule_config_from_env() {
        let env = create_test_env();
        let config = env.schedule.schedule_config().unwrap();

        assert_eq!(config.fire_at, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(config.timezone, chrono_tz::Asia::Kolkata);
        assert_eq!(config.tolerance, TimeDelta::zero());
        assert!(config.skip_weekends);
    }
}
