// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(backtrace_on_crash)]
use crate::collector::{Launcher, VaultStorage, VaultWarning, VaultWriter};
use crate::settings::{BacktraceSettings, FrozenSettings, SettingsParser};
use crate::shared::host::{EnvSource, HostProbe};
use crate::InitOptions;
use serde::Serialize;
use tracing::{debug, warn};

/// Everything the crash handler needs, frozen at initialisation.
#[derive(Debug)]
pub struct BacktraceState {
    settings: FrozenSettings,
    backtracer_path: Option<String>,
    #[cfg(backtrace_on_crash)]
    launcher: Option<Launcher>,
}

#[derive(Serialize)]
struct StateDump<'a> {
    settings: &'a FrozenSettings,
    backtracer_path: Option<&'a str>,
    environment: Vec<String>,
}

impl BacktraceState {
    pub fn settings(&self) -> &FrozenSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled()
    }

    pub fn backtracer_path(&self) -> Option<&str> {
        self.backtracer_path.as_deref()
    }

    /// Present iff backtracing is enabled.
    #[cfg(backtrace_on_crash)]
    pub fn launcher(&self) -> Option<&Launcher> {
        self.launcher.as_ref()
    }

    /// The same state with backtracing turned off.
    pub(crate) fn into_disabled(mut self) -> Self {
        self.settings.disable();
        #[cfg(backtrace_on_crash)]
        {
            self.launcher = None;
        }
        self
    }

    /// A disabled copy, for when the crash handler cannot be installed.
    pub(crate) fn to_disabled(&self) -> Self {
        Self {
            settings: self.settings,
            backtracer_path: self.backtracer_path.clone(),
            #[cfg(backtrace_on_crash)]
            launcher: None,
        }
        .into_disabled()
    }

    /// Reads the settings from `env`, resolves them against `host` and, when backtracing stays
    /// enabled, fills and write-protects `storage`. Never fails; every problem is logged and
    /// falls back to a safe default.
    pub(crate) fn resolve(
        options: &InitOptions,
        env: &(impl EnvSource + ?Sized),
        host: &impl HostProbe,
        #[cfg(backtrace_on_crash)] storage: Option<&'static mut VaultStorage>,
    ) -> Self {
        let parser = match &options.namespace {
            Some(namespace) => SettingsParser::with_namespace(namespace.as_str()),
            None => SettingsParser::new(),
        };
        let mut settings = BacktraceSettings::default();
        let parse_warnings = match env.var(&options.settings_var) {
            Some(raw) => parser.parse(&raw, &mut settings),
            None => vec![],
        };
        let resolution = settings.freeze(host);
        let settings = resolution.settings;
        let report = !settings.suppress_warnings();
        if report {
            for warning in &parse_warnings {
                warn!("{warning}");
            }
            for warning in &resolution.warnings {
                warn!("{warning}");
            }
        }

        let state = Self {
            settings,
            backtracer_path: resolution.backtracer_path,
            #[cfg(backtrace_on_crash)]
            launcher: None,
        };

        #[cfg(backtrace_on_crash)]
        let state = state.with_launcher(
            options,
            env,
            storage,
            resolution.output_path.as_deref(),
            report,
        );

        state.log_debug_dump();
        state
    }

    #[cfg(backtrace_on_crash)]
    fn with_launcher(
        mut self,
        options: &InitOptions,
        env: &(impl EnvSource + ?Sized),
        storage: Option<&'static mut VaultStorage>,
        output_path: Option<&str>,
        report: bool,
    ) -> Self {
        if !self.settings.enabled() {
            return self;
        }
        let Some(path) = self.backtracer_path.clone() else {
            return self.into_disabled();
        };
        let Some(storage) = storage else {
            if report {
                warn!("backtrace vault already in use; backtracing disabled");
            }
            return self.into_disabled();
        };

        let (writer, warnings) =
            VaultWriter::populate(storage, &path, env, output_path, &options.settings_var);
        for warning in &warnings {
            if report {
                warn!("{warning}");
            }
            match warning {
                VaultWarning::BacktracerPathTooLong { .. } | VaultWarning::BacktracerPathInvalid => {
                    self.settings.disable();
                }
                VaultWarning::OutputPathTooLong { .. } | VaultWarning::OutputPathInvalid => {
                    self.settings.drop_output_file();
                }
                VaultWarning::EnvironmentTooLong { .. } => (),
            }
        }
        if !self.settings.enabled() {
            return self.into_disabled();
        }

        match writer.freeze() {
            Ok(vault) => {
                self.launcher = Some(Launcher::new(self.settings, vault));
                self
            }
            Err(e) => {
                if report {
                    warn!("{e}; backtracing disabled");
                }
                self.into_disabled()
            }
        }
    }

    fn log_debug_dump(&self) {
        #[cfg(backtrace_on_crash)]
        let environment = self
            .launcher
            .iter()
            .flat_map(|launcher| launcher.vault().environment())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect();
        #[cfg(not(backtrace_on_crash))]
        let environment = vec![];

        let dump = StateDump {
            settings: &self.settings,
            backtracer_path: self.backtracer_path(),
            environment,
        };
        match serde_json::to_string(&dump) {
            Ok(json) => debug!(state = %json, "backtrace-on-crash settings"),
            Err(e) => debug!("unable to serialize backtrace-on-crash settings: {e}"),
        }
    }
}

#[cfg(all(test, backtrace_on_crash))]
mod tests {
    use super::*;
    use crate::settings::ResolvedOutput;
    use crate::shared::constants::DD_BACKTRACE_PATH_SIZE;
    use crate::shared::host::tests::FakeHost;

    fn resolve(env: &[(&str, &str)], host: &FakeHost) -> BacktraceState {
        BacktraceState::resolve(
            &InitOptions::default(),
            env,
            host,
            Some(VaultStorage::leaked()),
        )
    }

    #[test]
    fn test_enabled_state_has_launcher() {
        let state = resolve(
            &[("DD_BACKTRACE", "enable=on,timeout=10"), ("PATH", "/bin")],
            &FakeHost::with_backtracer(),
        );
        assert!(state.is_enabled());
        assert_eq!(state.settings().timeout(), 10);
        let launcher = state.launcher().unwrap();
        assert_eq!(
            launcher.vault().backtracer_path().unwrap().to_bytes(),
            b"/opt/dd/libexec/dd-backtrace"
        );
        let env: Vec<&[u8]> = launcher.vault().environment().collect();
        assert_eq!(env, vec![b"DD_BACKTRACE=enable=no".as_slice(), b"PATH=/bin"]);
    }

    #[test]
    fn test_disabled_state_has_no_launcher() {
        let state = resolve(
            &[("DD_BACKTRACE", "enable=off")],
            &FakeHost::with_backtracer(),
        );
        assert!(!state.is_enabled());
        assert!(state.launcher().is_none());
    }

    #[test]
    fn test_missing_backtracer_disables() {
        let state = resolve(&[("DD_BACKTRACE", "enable=on")], &FakeHost::default());
        assert!(!state.is_enabled());
        assert!(state.launcher().is_none());
    }

    #[test]
    fn test_privileged_process_disables() {
        let host = FakeHost {
            privileged: true,
            ..FakeHost::with_backtracer()
        };
        let state = resolve(&[("DD_BACKTRACE", "enable=on")], &host);
        assert!(!state.is_enabled());
        assert!(state.launcher().is_none());
    }

    #[test]
    fn test_overlong_backtracer_path_disables() {
        let long_path = format!("backtracer={}", "b".repeat(DD_BACKTRACE_PATH_SIZE));
        let state = resolve(
            &[("DD_BACKTRACE", format!("enable=on,{long_path}").as_str())],
            &FakeHost::default(),
        );
        assert!(!state.is_enabled());
        assert!(state.launcher().is_none());
    }

    #[test]
    fn test_unstorable_output_path_falls_back() {
        let setting = format!("enable=on,output-to=/tmp/{}", "o".repeat(20_000));
        let state = resolve(
            &[("DD_BACKTRACE", setting.as_str())],
            &FakeHost::with_backtracer(),
        );
        assert!(state.is_enabled());
        assert_eq!(state.settings().output(), ResolvedOutput::Stderr);
        assert!(state.launcher().unwrap().vault().output_path().is_none());
    }

    #[test]
    fn test_missing_vault_disables() {
        let state = BacktraceState::resolve(
            &InitOptions::default(),
            &[("DD_BACKTRACE", "enable=on")][..],
            &FakeHost::with_backtracer(),
            None,
        );
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_disabled_copy() {
        let state = resolve(&[("DD_BACKTRACE", "enable=on")], &FakeHost::with_backtracer());
        let disabled = state.to_disabled();
        assert!(state.is_enabled());
        assert!(!disabled.is_enabled());
        assert!(disabled.launcher().is_none());
        assert_eq!(disabled.backtracer_path(), state.backtracer_path());
    }
}
