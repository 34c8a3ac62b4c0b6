/// Win32 service host glue: hands the process to the service control
/// dispatcher, bridges SCM stop/shutdown controls onto the shared
/// StopSignal, and runs the supervisor loop as the service body.
///
/// The SCM callback ABI carries no context pointer, so the service keeps a
/// minimal static bridge (context + status handle); everything past the
/// entry points is injected explicitly.
use crate::config::TraywatchConfig;
use crate::paths;
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;
use crate::win::{TokenLauncher, WtsSessionResolver};
use std::ffi::{c_void, OsStr};
use std::os::windows::ffi::OsStrExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, info};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::System::Services::{
    RegisterServiceCtrlHandlerW, SetServiceStatus, StartServiceCtrlDispatcherW,
    SERVICE_ACCEPT_SHUTDOWN, SERVICE_ACCEPT_STOP, SERVICE_CONTROL_SHUTDOWN, SERVICE_CONTROL_STOP,
    SERVICE_RUNNING, SERVICE_START_PENDING, SERVICE_STATUS, SERVICE_STATUS_CURRENT_STATE,
    SERVICE_STATUS_HANDLE, SERVICE_STOPPED, SERVICE_STOP_PENDING, SERVICE_TABLE_ENTRYW,
    SERVICE_WIN32_OWN_PROCESS,
};

struct ServiceContext {
    config: TraywatchConfig,
    stop: Arc<StopSignal>,
}

static CONTEXT: OnceLock<ServiceContext> = OnceLock::new();
static STATUS_HANDLE: AtomicUsize = AtomicUsize::new(0);

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

/// Connect to the service control dispatcher and block until the service
/// stops. Fails immediately when invoked from a console instead of the SCM.
pub fn run(config: TraywatchConfig) -> Result<(), String> {
    let mut name = wide(&config.service.name);
    CONTEXT
        .set(ServiceContext {
            config,
            stop: Arc::new(StopSignal::new()),
        })
        .map_err(|_| "service context already initialized".to_string())?;

    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: PWSTR(name.as_mut_ptr()),
            lpServiceProc: Some(service_main),
        },
        SERVICE_TABLE_ENTRYW::default(),
    ];
    unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) }.map_err(|e| {
        format!(
            "failed to connect to the service control manager: {e} \
             (run `traywatch debug` for a console session)"
        )
    })
}

unsafe extern "system" fn service_main(_argc: u32, _argv: *mut PWSTR) {
    let Some(context) = CONTEXT.get() else {
        return;
    };

    let name = wide(&context.config.service.name);
    let handle =
        match unsafe { RegisterServiceCtrlHandlerW(PCWSTR(name.as_ptr()), Some(control_handler)) }
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to register service control handler");
                return;
            }
        };
    STATUS_HANDLE.store(handle.0 as usize, Ordering::SeqCst);

    report_status(SERVICE_START_PENDING, 1);
    info!(service = %context.config.service.name, "service starting");
    report_status(SERVICE_RUNNING, 0);

    run_supervisor(context);

    report_status(SERVICE_STOPPED, 0);
}

unsafe extern "system" fn control_handler(control: u32) {
    match control {
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            info!("service stop requested");
            report_status(SERVICE_STOP_PENDING, 1);
            if let Some(context) = CONTEXT.get() {
                context.stop.set();
            }
        }
        _ => {}
    }
}

fn run_supervisor(context: &ServiceContext) {
    let executable = match paths::agent_executable(&context.config.agent) {
        Ok(path) => path,
        Err(e) => {
            // Nothing to supervise; the service reports stopped.
            error!(error = %e, "cannot start supervision");
            return;
        }
    };

    Supervisor::new(
        WtsSessionResolver,
        TokenLauncher,
        Arc::clone(&context.stop),
        executable,
        context.config.supervisor.tunables(),
    )
    .run();
}

fn report_status(state: SERVICE_STATUS_CURRENT_STATE, checkpoint: u32) {
    let raw = STATUS_HANDLE.load(Ordering::SeqCst);
    if raw == 0 {
        return;
    }
    let pending = state == SERVICE_START_PENDING || state == SERVICE_STOP_PENDING;
    let status = SERVICE_STATUS {
        dwServiceType: SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: state,
        dwControlsAccepted: if state == SERVICE_RUNNING {
            SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN
        } else {
            0
        },
        dwWin32ExitCode: 0,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: checkpoint,
        dwWaitHint: if pending { 3_000 } else { 0 },
    };
    unsafe {
        let _ = SetServiceStatus(SERVICE_STATUS_HANDLE(raw as *mut c_void), &status);
    }
}
