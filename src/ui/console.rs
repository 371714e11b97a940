use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::command::{command_for_key, Command};
use super::display::{DispCtl, DispFlag};
use super::view::ViewType;

/// Control-pipe bytes. The resize byte comes from the SIGWINCH handler,
/// the quit byte from the display thread, the interrupt byte from the
/// SIGINT/SIGTERM handlers.
pub const PIPE_CHAR_QUIT: u8 = b'q';
pub const PIPE_CHAR_RESIZE: u8 = b'r';
pub const PIPE_CHAR_INT: u8 = b'i';

/// Shared console state: the control pipe plus the current view type,
/// which keystroke translation needs for context-sensitive keys.
pub struct ConsoleCtl {
    pipe_read: RawFd,
    pipe_write: RawFd,
    view_type: AtomicUsize,
    cmt_enabled: bool,
}

impl ConsoleCtl {
    pub fn new(cmt_enabled: bool) -> io::Result<Arc<ConsoleCtl>> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Arc::new(ConsoleCtl {
            pipe_read: fds[0],
            pipe_write: fds[1],
            view_type: AtomicUsize::new(ViewType::Home as usize),
            cmt_enabled,
        }))
    }

    fn write_byte(&self, byte: u8) {
        let buf = [byte];
        unsafe {
            libc::write(self.pipe_write, buf.as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn request_quit(&self) {
        self.write_byte(PIPE_CHAR_QUIT);
    }

    /// Signal-handler side of a resize: one pipe byte, nothing else.
    pub fn notify_resize(&self) {
        self.write_byte(PIPE_CHAR_RESIZE);
    }

    pub fn notify_interrupt(&self) {
        self.write_byte(PIPE_CHAR_INT);
    }

    pub fn set_view_type(&self, view: ViewType) {
        self.view_type.store(view as usize, Ordering::Relaxed);
    }

    fn current_view_type(&self) -> ViewType {
        ViewType::ALL[self.view_type.load(Ordering::Relaxed) % ViewType::ALL.len()]
    }
}

impl Drop for ConsoleCtl {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}

fn read_byte(fd: RawFd) -> Option<u8> {
    let mut buf = [0u8; 1];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
    (n == 1).then_some(buf[0])
}

/// Read one byte from stdin if it arrives within `timeout_ms`; used to
/// collect the tail of an escape sequence.
fn read_byte_timeout(fd: RawFd, timeout_ms: i32) -> Option<u8> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ready <= 0 {
        return None;
    }

    read_byte(fd)
}

enum Key {
    Up,
    Down,
    Enter,
    Char(u8),
}

fn next_key(fd: RawFd) -> Option<Key> {
    let byte = read_byte(fd)?;
    match byte {
        b'\r' | b'\n' => Some(Key::Enter),
        0x1b => {
            // Arrow keys arrive as ESC [ A/B.
            let second = read_byte_timeout(fd, 20)?;
            if second != b'[' {
                return None;
            }
            match read_byte_timeout(fd, 20)? {
                b'A' => Some(Key::Up),
                b'B' => Some(Key::Down),
                _ => None,
            }
        }
        other => Some(Key::Char(other)),
    }
}

/// The console thread: multiplexes stdin and the control pipe, turning
/// keystrokes into commands for the display thread. Terminates on the
/// quit byte or when stdin goes away.
pub fn console_thread(ctl: Arc<ConsoleCtl>, disp: Arc<DispCtl>) {
    // Bring the home view up once the UI threads are running.
    disp.send_cmd(Command::Home);

    loop {
        let mut fds = [
            libc::pollfd {
                fd: libc::STDIN_FILENO,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: ctl.pipe_read,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::debug!("console: poll failed: {err}");
            disp.quit();
            break;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            match read_byte(ctl.pipe_read) {
                Some(PIPE_CHAR_QUIT) => {
                    log::debug!("console: received quit byte");
                    break;
                }
                Some(PIPE_CHAR_RESIZE) => disp.send_cmd(Command::Resize),
                Some(PIPE_CHAR_INT) => disp.send_cmd(Command::Quit),
                _ => {}
            }
            continue;
        }

        if fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            if fds[0].revents & libc::POLLHUP != 0 {
                log::debug!("console: stdin closed");
                disp.quit();
                break;
            }

            match next_key(libc::STDIN_FILENO) {
                Some(Key::Up) => disp.scroll(DispFlag::ScrollUp),
                Some(Key::Down) => disp.scroll(DispFlag::ScrollDown),
                Some(Key::Enter) => disp.scroll(DispFlag::ScrollEnter),
                Some(Key::Char(ch)) => {
                    let view = ctl.current_view_type();
                    if let Some(cmd) = command_for_key(ch, view, ctl.cmt_enabled) {
                        disp.send_cmd(cmd);
                    }
                }
                None => {}
            }
        }
    }

    log::debug!("console thread is exiting");
}
