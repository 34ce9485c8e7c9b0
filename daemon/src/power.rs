/// Power-setting broadcast watcher and the pure broadcast classifier.
///
/// The watcher runs on a dedicated OS thread with its own Windows message
/// pump: a message-only window registered for the lid-switch and
/// console-display power settings forwards each broadcast to the main event
/// loop. The thread exits cleanly when [`PowerWatchHandle::stop`] is called.
///
/// On non-Windows platforms the public API compiles but is a no-op at
/// runtime; broadcasts never arrive.
use std::sync::OnceLock;
use tokio::sync::mpsc;

use crate::event::AgentEvent;

/// Tokio channel used to forward broadcasts from the window procedure to the
/// main event loop. Set once by [`start`].
static WATCH_TX: OnceLock<mpsc::Sender<AgentEvent>> = OnceLock::new();

// ── Broadcast model ───────────────────────────────────────────────────────────

/// The power setting a broadcast refers to.
///
/// The OS identifies settings by GUID; anything other than the two settings
/// the agent registers for maps to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSetting {
    /// Lid open/closed state.
    LidSwitch,
    /// Display powered on/off state.
    MonitorPower,
    /// Any setting the agent does not recognize.
    Other,
}

/// One power-setting broadcast as delivered by the OS: which setting changed
/// and the first 32-bit word of its data payload (non-zero = powered/open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBroadcast {
    pub setting: PowerSetting,
    pub data: u32,
}

/// Semantic meaning of a broadcast, as decided by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticEvent {
    LidClosed,
    LidOpened,
    MonitorOff,
    MonitorOn,
    Irrelevant,
}

impl SemanticEvent {
    /// Closing transitions are the only ones eligible to trigger effects.
    pub fn is_closing(self) -> bool {
        matches!(self, SemanticEvent::LidClosed | SemanticEvent::MonitorOff)
    }

    /// Short phrase for log lines.
    pub fn describe(self) -> &'static str {
        match self {
            SemanticEvent::LidClosed => "lid closed",
            SemanticEvent::LidOpened => "lid opened",
            SemanticEvent::MonitorOff => "monitor powered off",
            SemanticEvent::MonitorOn => "monitor powered on",
            SemanticEvent::Irrelevant => "irrelevant broadcast",
        }
    }
}

/// Maps a raw broadcast to its semantic meaning.
///
/// Broadcasts received inside a remote desktop session do not reflect
/// physical hardware state and are always `Irrelevant` — a remote client's
/// virtual display going dark must never lock the console session.
pub fn classify(raw: RawBroadcast, is_remote_session: bool) -> SemanticEvent {
    if is_remote_session {
        return SemanticEvent::Irrelevant;
    }
    let powered = raw.data != 0;
    match raw.setting {
        PowerSetting::LidSwitch if powered => SemanticEvent::LidOpened,
        PowerSetting::LidSwitch => SemanticEvent::LidClosed,
        PowerSetting::MonitorPower if powered => SemanticEvent::MonitorOn,
        PowerSetting::MonitorPower => SemanticEvent::MonitorOff,
        PowerSetting::Other => SemanticEvent::Irrelevant,
    }
}

/// Whether the current session is a remote (RDP-style) session.
pub fn is_remote_session() -> bool {
    #[cfg(windows)]
    {
        imp::is_remote_session()
    }
    #[cfg(not(windows))]
    false
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A handle to the running power watcher, used to stop its pump thread when
/// the agent exits.
pub struct PowerWatchHandle {
    #[cfg(windows)]
    _thread: std::thread::JoinHandle<()>,
    /// Thread ID of the message-pump thread, used to post `WM_QUIT`.
    #[cfg(windows)]
    thread_id: u32,
}

impl PowerWatchHandle {
    /// Signals the pump thread to stop and blocks until it exits.
    pub fn stop(self) {
        #[cfg(windows)]
        {
            imp::post_quit(self.thread_id);
            let _ = self._thread.join();
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Registers for lid-switch and display power-setting notifications on a
/// dedicated OS thread and returns a [`PowerWatchHandle`].
///
/// Each broadcast is forwarded to `tx` via a non-blocking
/// [`try_send`](mpsc::Sender::try_send); if the channel is full the
/// broadcast is dropped for that cycle.
///
/// # Windows
/// Window-class registration, window creation, and notification registration
/// failures are fatal: the error is reported and the process exits.
///
/// # Non-Windows
/// Returns a stub handle; all methods compile and run but do nothing.
pub fn start(tx: mpsc::Sender<AgentEvent>) -> PowerWatchHandle {
    // Silently ignore if called more than once (e.g. in test binaries).
    let _ = WATCH_TX.set(tx);

    #[cfg(windows)]
    {
        let (id_tx, id_rx) = std::sync::mpsc::sync_channel::<u32>(1);
        let thread = std::thread::Builder::new()
            .name("power-pump".into())
            .spawn(move || imp::run_message_pump(id_tx))
            .expect("Failed to spawn power watcher thread");
        let thread_id = id_rx.recv().expect("power watcher did not send its ID");
        PowerWatchHandle { _thread: thread, thread_id }
    }

    #[cfg(not(windows))]
    PowerWatchHandle {}
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::mpsc as std_mpsc;

    use windows::core::{GUID, PCWSTR};
    use windows::Win32::Foundation::{HANDLE, HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::Power::{
        RegisterPowerSettingNotification, UnregisterPowerSettingNotification,
        HPOWERNOTIFY, POWERBROADCAST_SETTING,
    };
    use windows::Win32::System::SystemServices::{
        GUID_CONSOLE_DISPLAY_STATE, GUID_LIDSWITCH_STATE_CHANGE,
    };
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        GetSystemMetrics, PostThreadMessageW, RegisterClassW, DEVICE_NOTIFY_WINDOW_HANDLE,
        HWND_MESSAGE, MSG, PBT_POWERSETTINGCHANGE, SM_REMOTESESSION, WINDOW_EX_STYLE,
        WINDOW_STYLE, WM_POWERBROADCAST, WM_QUIT, WNDCLASSW,
    };

    use super::{PowerSetting, RawBroadcast, WATCH_TX};
    use crate::event::AgentEvent;

    const CLASS_NAME: &str = "LidlockPowerWatcher";

    /// Converts a Rust `&str` to a null-terminated UTF-16 `Vec<u16>`.
    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn is_remote_session() -> bool {
        unsafe { GetSystemMetrics(SM_REMOTESESSION) != 0 }
    }

    fn setting_from_guid(guid: &GUID) -> PowerSetting {
        if *guid == GUID_LIDSWITCH_STATE_CHANGE {
            PowerSetting::LidSwitch
        } else if *guid == GUID_CONSOLE_DISPLAY_STATE {
            PowerSetting::MonitorPower
        } else {
            PowerSetting::Other
        }
    }

    /// Window procedure for the message-only watcher window.
    ///
    /// `WM_POWERBROADCAST`/`PBT_POWERSETTINGCHANGE` carries a
    /// `POWERBROADCAST_SETTING`; its first 32-bit data word is the boolean
    /// payload (zero = closed/off).
    unsafe extern "system" fn wnd_proc(
        hwnd: HWND,
        msg: u32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        if msg == WM_POWERBROADCAST && w_param.0 as u32 == PBT_POWERSETTINGCHANGE {
            let setting = &*(l_param.0 as *const POWERBROADCAST_SETTING);
            // Data is declared [u8; 1] but DataLength bytes follow in place.
            let data = if setting.DataLength >= 4 {
                std::ptr::read_unaligned(setting.Data.as_ptr() as *const u32)
            } else {
                0
            };
            let raw = RawBroadcast {
                setting: setting_from_guid(&setting.PowerSetting),
                data,
            };
            if let Some(tx) = WATCH_TX.get() {
                // try_send is non-blocking; a full channel drops this broadcast.
                let _ = tx.try_send(AgentEvent::Power(raw));
            }
            return LRESULT(1); // TRUE
        }
        DefWindowProcW(hwnd, msg, w_param, l_param)
    }

    /// Creates a message-only window, registers both power-setting
    /// notifications, and pumps messages until `WM_QUIT`.
    ///
    /// Sends the current thread ID to `id_tx` before entering the pump so
    /// that [`super::start`] can later use it to post `WM_QUIT`.
    ///
    /// A failed OS registration is fatal for the whole process: the agent
    /// has no recovery path for a broken notification source.
    pub fn run_message_pump(id_tx: std_mpsc::SyncSender<u32>) {
        unsafe {
            let _ = id_tx.send(GetCurrentThreadId());
            drop(id_tx);

            let hinstance: HINSTANCE = match GetModuleHandleW(None) {
                Ok(h) => h.into(),
                Err(e) => fatal("GetModuleHandleW", &e),
            };

            let class_name = to_wide(CLASS_NAME);
            let wc = WNDCLASSW {
                lpfnWndProc: Some(wnd_proc),
                hInstance: hinstance,
                lpszClassName: PCWSTR(class_name.as_ptr()),
                ..Default::default()
            };
            if RegisterClassW(&wc) == 0 {
                fatal("RegisterClassW", &windows::core::Error::from_win32());
            }

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                PCWSTR(class_name.as_ptr()),
                PCWSTR::null(),
                WINDOW_STYLE::default(),
                0,
                0,
                0,
                0,
                HWND_MESSAGE, // message-only window, never visible
                None,
                hinstance,
                None,
            );
            if hwnd.0 == 0 {
                fatal("CreateWindowExW", &windows::core::Error::from_win32());
            }

            let lid = register_setting(hwnd, &GUID_LIDSWITCH_STATE_CHANGE);
            let display = register_setting(hwnd, &GUID_CONSOLE_DISPLAY_STATE);

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            loop {
                let got = GetMessageW(&mut msg, None, 0, 0).0;
                if got == 0 {
                    break;
                }
                if got < 0 {
                    fatal("GetMessageW", &windows::core::Error::from_win32());
                }
                DispatchMessageW(&msg);
            }

            let _ = UnregisterPowerSettingNotification(lid);
            let _ = UnregisterPowerSettingNotification(display);
            let _ = DestroyWindow(hwnd);
            eprintln!("[power] Watcher thread exited");
        }
    }

    unsafe fn register_setting(hwnd: HWND, guid: &GUID) -> HPOWERNOTIFY {
        match RegisterPowerSettingNotification(
            HANDLE(hwnd.0),
            guid,
            DEVICE_NOTIFY_WINDOW_HANDLE,
        ) {
            Ok(h) => h,
            Err(e) => fatal("RegisterPowerSettingNotification", &e),
        }
    }

    fn fatal(call: &str, err: &windows::core::Error) -> ! {
        eprintln!("[power] {call} failed: {err}");
        std::process::exit(1);
    }

    /// Posts `WM_QUIT` to `thread_id`, causing its `GetMessageW` loop to exit.
    pub fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: [PowerSetting; 3] = [
        PowerSetting::LidSwitch,
        PowerSetting::MonitorPower,
        PowerSetting::Other,
    ];

    // ── remote sessions ───────────────────────────────────────────────────────

    #[test]
    fn remote_session_always_classifies_irrelevant() {
        for setting in SETTINGS {
            for data in [0u32, 1, 0xFFFF_FFFF] {
                let raw = RawBroadcast { setting, data };
                assert_eq!(
                    classify(raw, true),
                    SemanticEvent::Irrelevant,
                    "remote session must mask {raw:?}"
                );
            }
        }
    }

    // ── lid switch ────────────────────────────────────────────────────────────

    #[test]
    fn lid_switch_zero_is_lid_closed() {
        let raw = RawBroadcast { setting: PowerSetting::LidSwitch, data: 0 };
        assert_eq!(classify(raw, false), SemanticEvent::LidClosed);
    }

    #[test]
    fn lid_switch_nonzero_is_lid_opened() {
        for data in [1u32, 2, 0xFFFF_FFFF] {
            let raw = RawBroadcast { setting: PowerSetting::LidSwitch, data };
            assert_eq!(classify(raw, false), SemanticEvent::LidOpened);
        }
    }

    // ── monitor power ─────────────────────────────────────────────────────────

    #[test]
    fn monitor_power_zero_is_monitor_off() {
        let raw = RawBroadcast { setting: PowerSetting::MonitorPower, data: 0 };
        assert_eq!(classify(raw, false), SemanticEvent::MonitorOff);
    }

    #[test]
    fn monitor_power_nonzero_is_monitor_on() {
        let raw = RawBroadcast { setting: PowerSetting::MonitorPower, data: 1 };
        assert_eq!(classify(raw, false), SemanticEvent::MonitorOn);
    }

    // ── unknown settings ──────────────────────────────────────────────────────

    #[test]
    fn unknown_setting_is_irrelevant_regardless_of_data() {
        for data in [0u32, 1, 42] {
            let raw = RawBroadcast { setting: PowerSetting::Other, data };
            assert_eq!(classify(raw, false), SemanticEvent::Irrelevant);
        }
    }

    // ── closing transitions ───────────────────────────────────────────────────

    #[test]
    fn only_lid_closed_and_monitor_off_are_closing() {
        assert!(SemanticEvent::LidClosed.is_closing());
        assert!(SemanticEvent::MonitorOff.is_closing());
        assert!(!SemanticEvent::LidOpened.is_closing());
        assert!(!SemanticEvent::MonitorOn.is_closing());
        assert!(!SemanticEvent::Irrelevant.is_closing());
    }

    #[test]
    fn describe_names_every_event() {
        let events = [
            SemanticEvent::LidClosed,
            SemanticEvent::LidOpened,
            SemanticEvent::MonitorOff,
            SemanticEvent::MonitorOn,
            SemanticEvent::Irrelevant,
        ];
        for event in events {
            assert!(!event.describe().is_empty());
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn non_windows_never_reports_a_remote_session() {
        assert!(!is_remote_session());
    }
}
