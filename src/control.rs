/// Administrative commands delegated to the native service control manager
/// via `sc.exe`: create, delete, start, stop, query, plus the recovery
/// policy applied at install time. The supervisor never reimplements any of
/// this; the SCM is the source of truth for service state.
use crate::config::ServiceConfig;
use std::path::Path;
use std::time::Duration;

/// Failure counter resets after a day of stable running.
const FAILURE_RESET_SECS: u32 = 86_400;
/// Restart the service 5s, 10s, then 30s after successive crashes. This is
/// the outer line of defense: the supervisor's own loop restarts the agent,
/// the SCM restarts the supervisor.
const FAILURE_ACTIONS: &str = "restart/5000/restart/10000/restart/30000";

/// `sc stop` error when the service is not running.
const ERROR_SERVICE_NOT_ACTIVE: &str = "1062";

struct ScOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl ScOutput {
    fn combined(&self) -> String {
        format!("{} {}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

#[cfg(windows)]
fn run_sc(args: &[String]) -> Result<ScOutput, String> {
    let output = std::process::Command::new("sc.exe")
        .args(args)
        .output()
        .map_err(|e| format!("failed to run sc.exe: {e}"))?;
    Ok(ScOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(not(windows))]
fn run_sc(_args: &[String]) -> Result<ScOutput, String> {
    Err("service control commands require Windows".to_string())
}

fn check(output: &ScOutput, action: &str) -> Result<(), String> {
    if output.code == 0 {
        return Ok(());
    }
    let mut message = format!("failed to {action}: {}", output.combined());
    if output.code == 5 {
        message.push_str(" (access denied; run as Administrator)");
    }
    Err(message)
}

fn create_args(service: &ServiceConfig, exe: &Path) -> Vec<String> {
    vec![
        "create".to_string(),
        service.name.clone(),
        format!("binPath={}", exe.display()),
        format!("DisplayName={}", service.display_name),
        "start=auto".to_string(),
    ]
}

fn description_args(service: &ServiceConfig) -> Vec<String> {
    vec![
        "description".to_string(),
        service.name.clone(),
        service.description.clone(),
    ]
}

fn failure_args(service: &ServiceConfig) -> Vec<String> {
    vec![
        "failure".to_string(),
        service.name.clone(),
        format!("reset={FAILURE_RESET_SECS}"),
        format!("actions={FAILURE_ACTIONS}"),
    ]
}

/// Register the service for the given supervisor executable: auto-start on
/// boot, description, and the crash recovery policy.
pub fn install(service: &ServiceConfig, exe: &Path) -> Result<(), String> {
    let output = run_sc(&create_args(service, exe))?;
    check(&output, "create service")?;

    let output = run_sc(&description_args(service))?;
    check(&output, "set service description")?;
    let output = run_sc(&failure_args(service))?;
    check(&output, "set service recovery policy")?;

    println!("Service '{}' installed.", service.display_name);
    println!("  - auto-start on boot");
    println!("  - automatic restart on failure");
    Ok(())
}

pub fn uninstall(service: &ServiceConfig) -> Result<(), String> {
    // Best effort: the service may not be running.
    let _ = stop(service);
    let output = run_sc(&["delete".to_string(), service.name.clone()])?;
    check(&output, "delete service")?;
    println!("Service '{}' removed.", service.display_name);
    Ok(())
}

pub fn start(service: &ServiceConfig) -> Result<(), String> {
    let output = run_sc(&["start".to_string(), service.name.clone()])?;
    check(&output, "start service")?;
    println!("Service '{}' started.", service.display_name);
    Ok(())
}

pub fn stop(service: &ServiceConfig) -> Result<(), String> {
    let output = run_sc(&["stop".to_string(), service.name.clone()])?;
    if output.code != 0 && stop_is_tolerated(&output.combined()) {
        println!("Service '{}' is not running.", service.display_name);
        return Ok(());
    }
    check(&output, "stop service")?;
    println!("Service '{}' stopped.", service.display_name);
    Ok(())
}

pub fn restart(service: &ServiceConfig) -> Result<(), String> {
    stop(service)?;
    std::thread::sleep(Duration::from_secs(2));
    start(service)
}

pub fn status(service: &ServiceConfig) -> Result<(), String> {
    let output = run_sc(&["query".to_string(), service.name.clone()])?;
    if output.code != 0 {
        println!("Service '{}' is not installed.", service.display_name);
        return Ok(());
    }
    println!("{}", output.stdout.trim());
    Ok(())
}

fn stop_is_tolerated(combined: &str) -> bool {
    combined.contains(ERROR_SERVICE_NOT_ACTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn service() -> ServiceConfig {
        ServiceConfig::default()
    }

    #[test]
    fn test_create_args() {
        let exe = PathBuf::from("C:\\Program Files\\TrayWatch\\traywatch.exe");
        assert_eq!(
            create_args(&service(), &exe),
            vec![
                "create",
                "TrayWatch",
                "binPath=C:\\Program Files\\TrayWatch\\traywatch.exe",
                "DisplayName=TrayWatch Agent Supervisor",
                "start=auto",
            ]
        );
    }

    #[test]
    fn test_failure_args_encode_recovery_policy() {
        assert_eq!(
            failure_args(&service()),
            vec![
                "failure",
                "TrayWatch",
                "reset=86400",
                "actions=restart/5000/restart/10000/restart/30000",
            ]
        );
    }

    #[test]
    fn test_description_args() {
        let args = description_args(&service());
        assert_eq!(args[0], "description");
        assert_eq!(args[1], "TrayWatch");
        assert!(args[2].contains("tray agent"));
    }

    #[test]
    fn test_stop_tolerates_not_running() {
        assert!(stop_is_tolerated(
            "[SC] ControlService FAILED 1062:  The service has not been started."
        ));
        assert!(!stop_is_tolerated("[SC] Access is denied."));
    }

    #[test]
    fn test_access_denied_gets_admin_hint() {
        let output = ScOutput {
            code: 5,
            stdout: "Access is denied.".to_string(),
            stderr: String::new(),
        };
        let err = check(&output, "create service").unwrap_err();
        assert!(err.contains("run as Administrator"));
    }

    #[test]
    fn test_success_passes_check() {
        let output = ScOutput {
            code: 0,
            stdout: "[SC] CreateService SUCCESS".to_string(),
            stderr: String::new(),
        };
        assert!(check(&output, "create service").is_ok());
    }
}
