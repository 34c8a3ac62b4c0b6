/// Windows implementations: console session lookup via WTS and process
/// creation inside the interactive user's session via a duplicated primary
/// token.
///
/// Every intermediate handle (user token, primary token, environment
/// block, thread handle) is a scoped resource closed on all paths; only the
/// process handle outlives the launch, owned by the returned child.
use crate::supervisor::{
    ChildProcess, LaunchError, LaunchStage, Launcher, SessionId, SessionResolver,
};
use std::ffi::{c_void, OsStr};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use tracing::warn;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_TIMEOUT};
use windows::Win32::Security::{
    DuplicateTokenEx, SecurityImpersonation, TokenPrimary, TOKEN_ALL_ACCESS,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::RemoteDesktop::{WTSGetActiveConsoleSessionId, WTSQueryUserToken};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, TerminateProcess, WaitForSingleObject, CREATE_NO_WINDOW,
    CREATE_UNICODE_ENVIRONMENT, NORMAL_PRIORITY_CLASS, PROCESS_INFORMATION,
    STARTF_USESHOWWINDOW, STARTUPINFOW,
};
use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

/// Sentinel returned by WTSGetActiveConsoleSessionId when no console
/// session is attached.
const NO_SESSION: u32 = 0xFFFF_FFFF;

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Owned kernel handle, closed exactly once on drop.
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// User environment block from the profile behind a token; the launched
/// agent must see the interactive user's variables, not the service's.
struct EnvironmentBlock(*mut c_void);

impl EnvironmentBlock {
    fn new(token: &OwnedHandle) -> windows::core::Result<Self> {
        let mut block: *mut c_void = std::ptr::null_mut();
        unsafe { CreateEnvironmentBlock(&mut block, token.raw(), false) }?;
        Ok(Self(block))
    }

    fn as_ptr(&self) -> *const c_void {
        self.0
    }
}

impl Drop for EnvironmentBlock {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyEnvironmentBlock(self.0);
        }
    }
}

/// Resolves the active console session via WTS.
pub struct WtsSessionResolver;

impl SessionResolver for WtsSessionResolver {
    fn active_session(&self) -> Option<SessionId> {
        let session = unsafe { WTSGetActiveConsoleSessionId() };
        if session == NO_SESSION {
            None
        } else {
            Some(SessionId(session))
        }
    }
}

/// Launches the agent as the interactive user of the target session.
pub struct TokenLauncher;

impl Launcher for TokenLauncher {
    type Child = WinChild;

    fn launch(&self, executable: &Path, session: SessionId) -> Result<WinChild, LaunchError> {
        let user_token = query_user_token(session)
            .map_err(|e| LaunchError::new(LaunchStage::QueryToken, e))?;
        let primary = duplicate_primary(&user_token)
            .map_err(|e| LaunchError::new(LaunchStage::DuplicateToken, e))?;
        let environment = EnvironmentBlock::new(&primary)
            .map_err(|e| LaunchError::new(LaunchStage::Environment, e))?;
        spawn_as_user(&primary, executable, &environment)
            .map_err(|e| LaunchError::new(LaunchStage::Spawn, e))
    }
}

fn query_user_token(session: SessionId) -> windows::core::Result<OwnedHandle> {
    let mut token = HANDLE::default();
    unsafe { WTSQueryUserToken(session.0, &mut token) }?;
    Ok(OwnedHandle(token))
}

fn duplicate_primary(token: &OwnedHandle) -> windows::core::Result<OwnedHandle> {
    let mut primary = HANDLE::default();
    unsafe {
        DuplicateTokenEx(
            token.raw(),
            TOKEN_ALL_ACCESS,
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut primary,
        )
    }?;
    Ok(OwnedHandle(primary))
}

fn spawn_as_user(
    token: &OwnedHandle,
    executable: &Path,
    environment: &EnvironmentBlock,
) -> windows::core::Result<WinChild> {
    // CreateProcessAsUserW may rewrite the command line buffer in place.
    let mut command_line = wide(OsStr::new(&format!("\"{}\"", executable.display())));
    let workdir = wide(
        executable
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .as_os_str(),
    );
    let mut desktop = wide(OsStr::new("winsta0\\default"));

    let mut startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        dwFlags: STARTF_USESHOWWINDOW,
        wShowWindow: SW_HIDE.0 as u16,
        lpDesktop: PWSTR(desktop.as_mut_ptr()),
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    unsafe {
        CreateProcessAsUserW(
            token.raw(),
            PCWSTR::null(),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false,
            CREATE_NO_WINDOW | CREATE_UNICODE_ENVIRONMENT | NORMAL_PRIORITY_CLASS,
            Some(environment.as_ptr()),
            PCWSTR(workdir.as_ptr()),
            &mut startup,
            &mut process_info,
        )
    }?;

    // The thread handle is not tracked; close it right away.
    let _thread = OwnedHandle(process_info.hThread);

    Ok(WinChild {
        pid: process_info.dwProcessId,
        handle: Some(OwnedHandle(process_info.hProcess)),
    })
}

/// A process launched into a user session. Owns the process handle; the
/// handle is closed exactly once, by `terminate` or by drop.
pub struct WinChild {
    pid: u32,
    handle: Option<OwnedHandle>,
}

impl WinChild {
    fn handle_is_alive(handle: &OwnedHandle) -> bool {
        unsafe { WaitForSingleObject(handle.raw(), 0) } == WAIT_TIMEOUT
    }
}

impl ChildProcess for WinChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        match &self.handle {
            Some(handle) => Self::handle_is_alive(handle),
            None => false,
        }
    }

    fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if Self::handle_is_alive(&handle) {
            if let Err(e) = unsafe { TerminateProcess(handle.raw(), 1) } {
                warn!(pid = self.pid, error = %e, "failed to terminate agent");
            }
        }
        // Handle closes as it drops here.
    }
}
