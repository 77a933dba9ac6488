// SPDX-License-Identifier: AGPL-3.0-only

//! The CLI collaborator: parses a program and its arguments, drives a
//! [`Controller`] to run it in a container, and streams its captured
//! output to this process's own stdout.
//!
//! This binary is also, itself, the trampoline: when invoked with the
//! dispatch token as its first argument it never reaches `main`'s own
//! argument parsing at all, and instead falls straight into
//! [`cordon::trampoline::run`].

use {
    clap::Parser,
    cordon::{
        cgroup::CgroupRoot,
        config::Config,
        controller::Controller,
        file_stream::Context,
        trampoline::{self, DISPATCH_TOKEN},
    },
    std::{
        ffi::CString,
        io::{self, Write},
        os::unix::ffi::OsStrExt,
        process::ExitCode,
        sync::Arc,
        time::Duration,
    },
};

/// Run a command inside a lightweight container and stream its output.
#[derive(Parser)]
#[command(name = "cordon")]
struct Cli
{
    /// Maximum time the command may run, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// The program to run.
    program: String,

    /// Arguments to pass to the program.
    args: Vec<String>,
}

fn main() -> ExitCode
{
    let mut raw_args = std::env::args_os();
    let _argv0 = raw_args.next();

    if raw_args.next().as_deref().map(|arg| arg.as_bytes()) == Some(DISPATCH_TOKEN.as_bytes()) {
        let argv: Vec<CString> = raw_args
            .map(|arg| CString::new(arg.as_bytes()).expect("argv must not contain NUL"))
            .collect();
        trampoline::run(&argv);
    }

    run_cli()
}

fn run_cli() -> ExitCode
{
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .init();

    let cgroup_root = match CgroupRoot::setup(config.cgroup_root()) {
        Ok(root) => Arc::new(root),
        Err(err) => {
            eprintln!("cordon: failed to set up cgroups: {err}");
            return ExitCode::from(1);
        },
    };

    let controller = Controller::new(Arc::clone(&config), Arc::clone(&cgroup_root));

    let mut argv = vec![CString::new(cli.program.as_bytes()).expect("program must not contain NUL")];
    argv.extend(cli.args.iter().map(|arg| CString::new(arg.as_bytes()).expect("argument must not contain NUL")));

    let command = match controller.start_command(argv) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("cordon: failed to start command: {err}");
            let _ = cgroup_root.tear_down();
            return ExitCode::from(1);
        },
    };

    install_interrupt_handler(Arc::clone(&command));

    let exit_code = match stream_output_and_wait(&command, Duration::from_secs(cli.timeout)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cordon: error streaming command output: {err}");
            1
        },
    };

    let _ = controller.finish_command(command.command_id());
    let _ = cgroup_root.tear_down();

    ExitCode::from(exit_code as u8)
}

fn stream_output_and_wait(command: &cordon::launcher::Command, timeout: Duration) -> Result<i32, String>
{
    let context = Context::with_timeout(timeout);
    let handle = command.new_log_stream(context, true).map_err(|err| err.to_string())?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut buf = [0u8; 8192];
    loop {
        let (n, eof) = handle.stream().read(&mut buf).map_err(|err| err.to_string())?;
        if n > 0 {
            stdout.write_all(&buf[..n]).map_err(|err| err.to_string())?;
        }
        if eof {
            break;
        }
    }
    stdout.flush().map_err(|err| err.to_string())?;

    command.wait();
    command.result_code().map_err(|err| err.to_string())
}

/// Forward SIGINT as a `Close()` on the in-flight command, the one piece
/// of process-wide signal handling the core deliberately leaves to its
/// collaborators.
fn install_interrupt_handler(command: Arc<cordon::launcher::Command>)
{
    let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    if signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag)).is_err() {
        return;
    }

    std::thread::spawn(move || {
        loop {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = command.close();
                break;
            }
            if !command.running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}
