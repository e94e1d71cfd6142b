//! Shell wrappers for session execs.
//!
//! Each session command runs in a shell of its own, started under `setsid` so
//! that it leads a fresh process group. The outer wrapper records that shell's
//! PID in a file inside the container. Timing out a command runs a second exec
//! that reads the file and kills the whole group, so backgrounded grandchildren
//! go down with it.
//!
//! Shell state survives between commands through a per-container state file:
//! on exit the command shell writes its working directory and `export -p`, and
//! the next command shell restores both before applying the request's own
//! working directory and environment.

pub const EXEC_WRAPPER_NAME: &str = "recon-exec";
pub const KILL_WRAPPER_NAME: &str = "recon-kill";

/// `$1` pidfile, `$2` command-shell script, then the command shell's arguments.
const EXEC_SCRIPT: &str = r#"pidfile=$1
script=$2
shift 2
if command -v setsid >/dev/null 2>&1; then
  setsid /bin/sh -c "$script" recon-session "$@" &
else
  /bin/sh -c "$script" recon-session "$@" &
fi
pid=$!
echo "$pid" > "$pidfile"
wait "$pid"
code=$?
rm -f "$pidfile"
exit "$code""#;

/// `$1` state file prefix, `$2` working directory or empty, `$3` command,
/// then `NAME=value` assignments.
const SESSION_SCRIPT: &str = r#"__recon_state=$1
__recon_workdir=$2
__recon_command=$3
shift 3
if [ -f "$__recon_state.env" ]; then
  . "$__recon_state.env"
fi
if [ -f "$__recon_state.cwd" ]; then
  cd "$(cat "$__recon_state.cwd")" 2>/dev/null || true
fi
if [ -n "$__recon_workdir" ]; then
  cd "$__recon_workdir" || exit 1
fi
for __recon_assignment in "$@"; do
  export "$__recon_assignment"
done
__recon_save() {
  pwd > "$__recon_state.cwd"
  export -p > "$__recon_state.env"
}
trap __recon_save EXIT
eval "$__recon_command""#;

const KILL_SCRIPT: &str = r#"pid=$(cat "$1" 2>/dev/null) || exit 0
[ -n "$pid" ] || exit 0
if ! kill -KILL -- "-$pid" 2>/dev/null; then
  pkill -KILL -P "$pid" 2>/dev/null
  kill -KILL "$pid" 2>/dev/null
fi
rm -f "$1"
exit 0"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedExec<'a> {
    Command { pidfile: &'a str, command: &'a str },
    Kill { pidfile: &'a str },
}

pub fn pidfile_path(prefix: &str, token: &str) -> String {
    format!("/tmp/.{prefix}-exec-{token}.pid")
}

/// Prefix of the files holding a session's shell state. One session per container.
pub fn session_state_path(prefix: &str) -> String {
    format!("/tmp/.{prefix}-session")
}

pub fn wrap_command(
    pidfile: &str,
    state: &str,
    command: &str,
    working_dir: Option<&str>,
    env: &[String],
) -> Vec<String> {
    let mut argv = vec![
        "/bin/sh".into(),
        "-c".into(),
        EXEC_SCRIPT.into(),
        EXEC_WRAPPER_NAME.into(),
        pidfile.into(),
        SESSION_SCRIPT.into(),
        state.into(),
        working_dir.unwrap_or_default().into(),
        command.into(),
    ];
    argv.extend(env.iter().cloned());
    argv
}

pub fn kill_command(pidfile: &str) -> Vec<String> {
    vec![
        "/bin/sh".into(),
        "-c".into(),
        KILL_SCRIPT.into(),
        KILL_WRAPPER_NAME.into(),
        pidfile.into(),
    ]
}

/// Recognise argv produced by [`wrap_command`] or [`kill_command`].
pub fn unwrap_command(argv: &[String]) -> Option<WrappedExec<'_>> {
    match argv {
        [sh, flag, _, name, pidfile, _, _, _, command, ..]
            if sh == "/bin/sh" && flag == "-c" && name == EXEC_WRAPPER_NAME =>
        {
            Some(WrappedExec::Command { pidfile, command })
        }
        [sh, flag, _, name, pidfile] if sh == "/bin/sh" && flag == "-c" && name == KILL_WRAPPER_NAME => {
            Some(WrappedExec::Kill { pidfile })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_commands_round_trip() {
        let pidfile = pidfile_path("recon", "abc123");
        assert_eq!(pidfile, "/tmp/.recon-exec-abc123.pid");
        let state = session_state_path("recon");

        let argv = wrap_command(
            &pidfile,
            &state,
            "nmap -sS -T2 example.com",
            Some("/work"),
            &["TARGET=example.com".to_owned()],
        );
        assert_eq!(
            unwrap_command(&argv),
            Some(WrappedExec::Command {
                pidfile: &pidfile,
                command: "nmap -sS -T2 example.com",
            })
        );

        let argv = kill_command(&pidfile);
        assert_eq!(
            unwrap_command(&argv),
            Some(WrappedExec::Kill { pidfile: &pidfile })
        );
    }

    #[test]
    fn command_is_passed_as_an_argument_not_spliced() {
        let argv = wrap_command("/tmp/p", "/tmp/s", "echo '$1' \"quoted\"; exit 3", None, &[]);
        assert_eq!(argv[2], EXEC_SCRIPT);
        assert_eq!(argv[5], SESSION_SCRIPT);
        assert_eq!(argv[7], "");
        assert_eq!(argv[8], "echo '$1' \"quoted\"; exit 3");
    }

    #[test]
    fn foreign_argv_is_not_recognised() {
        let argv: Vec<String> = vec!["/bin/sh".into(), "-c".into(), "ls".into()];
        assert_eq!(unwrap_command(&argv), None);
    }

    #[cfg(unix)]
    mod shell {
        use std::path::Path;
        use std::process::{Command, Output, Stdio};
        use std::time::{Duration, Instant};

        use super::super::*;

        struct Session {
            dir: tempfile::TempDir,
        }

        impl Session {
            fn new() -> Self {
                Self {
                    dir: tempfile::tempdir().unwrap(),
                }
            }

            fn path(&self, name: &str) -> String {
                self.dir.path().join(name).to_string_lossy().into_owned()
            }

            fn argv(&self, command: &str, working_dir: Option<&str>, env: &[&str]) -> Vec<String> {
                let env: Vec<String> = env.iter().map(|pair| (*pair).to_owned()).collect();
                wrap_command(
                    &self.path("exec.pid"),
                    &self.path("session"),
                    command,
                    working_dir,
                    &env,
                )
            }

            fn run(&self, command: &str, working_dir: Option<&str>, env: &[&str]) -> Output {
                let argv = self.argv(command, working_dir, env);
                Command::new(&argv[0]).args(&argv[1..]).output().unwrap()
            }
        }

        fn stdout(output: &Output) -> String {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }

        fn wait_for_file(path: &str) -> String {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Ok(contents) = std::fs::read_to_string(path) {
                    if !contents.trim().is_empty() {
                        return contents.trim().to_owned();
                    }
                }
                assert!(Instant::now() < deadline, "{path} never written");
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        #[test]
        fn directory_and_exports_carry_over_between_commands() {
            let session = Session::new();
            let work = session.path("work");
            std::fs::create_dir(&work).unwrap();

            let first = session.run(
                &format!("cd '{work}' && export SCAN_TARGET=example.com"),
                None,
                &[],
            );
            assert!(first.status.success());

            let second = session.run("pwd; echo \"$SCAN_TARGET\"", None, &[]);
            assert_eq!(stdout(&second), format!("{work}\nexample.com\n"));
        }

        #[test]
        fn exit_status_is_kept_and_state_still_saved() {
            let session = Session::new();
            let output = session.run("cd / && exit 3", None, &[]);
            assert_eq!(output.status.code(), Some(3));

            let next = session.run("pwd", None, &[]);
            assert_eq!(stdout(&next), "/\n");
        }

        #[test]
        fn request_directory_and_env_win_over_saved_state() {
            let session = Session::new();
            let work = session.path("work");
            std::fs::create_dir(&work).unwrap();
            session.run("cd / && export MODE=old", None, &[]);

            let output = session.run("pwd; echo \"$MODE\"", Some(&work), &["MODE=new"]);
            assert_eq!(stdout(&output), format!("{work}\nnew\n"));
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn kill_takes_down_background_children() {
            let session = Session::new();
            let child_file = session.path("child.pid");
            let argv = session.argv(
                &format!("sleep 60 & echo $! > '{child_file}'; wait"),
                None,
                &[],
            );
            let mut wrapper = Command::new(&argv[0])
                .args(&argv[1..])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .unwrap();

            let pidfile = session.path("exec.pid");
            wait_for_file(&pidfile);
            let child = wait_for_file(&child_file);

            let kill = kill_command(&pidfile);
            let status = Command::new(&kill[0]).args(&kill[1..]).status().unwrap();
            assert!(status.success());

            let deadline = Instant::now() + Duration::from_secs(5);
            let exit = loop {
                if let Some(status) = wrapper.try_wait().unwrap() {
                    break status;
                }
                assert!(Instant::now() < deadline, "wrapper still running after kill");
                std::thread::sleep(Duration::from_millis(10));
            };
            assert_eq!(exit.code(), Some(137));

            // the backgrounded sleep is gone or only awaiting reaping
            let stat = Path::new("/proc").join(&child).join("stat");
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match std::fs::read_to_string(&stat) {
                    Err(_) => break,
                    Ok(line) if line.contains(") Z ") => break,
                    Ok(_) => {
                        assert!(Instant::now() < deadline, "sleep {child} survived the kill");
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            assert!(!Path::new(&pidfile).exists());
        }
    }
}
