//! Shell quoting and the command lines handed to `bash -lc` / `bash -lic` inside WSL.
//!
//! Every dynamic token is escaped on its own before the tokens are joined with
//! spaces. Nothing user-supplied is interpolated raw.

/// Wrap a native path in double quotes unless both ends are already quoted.
pub fn escape_for_native_shell(value: &str) -> String {
    let value = value.trim();
    let quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
    if quoted {
        value.to_string()
    } else {
        format!("\"{value}\"")
    }
}

/// POSIX single-quote escaping: `it's` becomes `'it'\''s'`.
pub fn escape_for_posix_shell(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Single-quote inline code for `python -c`, doubling backslashes first so they
/// survive the extra quoting layer of `bash -lic`.
pub fn escape_inline_code(code: &str) -> String {
    let quoted = code.replace('\\', r"\\").replace('\'', r"'\''");
    format!("'{quoted}'")
}

/// Render a native argument list as a single line, for logs.
pub fn render_native_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|token| {
            if token.is_empty() || token.chars().any(char::is_whitespace) {
                escape_for_native_shell(token)
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn join_posix<'a>(tokens: impl IntoIterator<Item = &'a str>) -> String {
    tokens
        .into_iter()
        .map(escape_for_posix_shell)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `which '<exe>'`
pub fn which_command(executable: &str) -> String {
    format!("which {}", escape_for_posix_shell(executable))
}

/// `test -f '<path>' && echo exists || echo missing`
pub fn file_exists_probe(path: &str) -> String {
    format!(
        "test -f {} && echo exists || echo missing",
        escape_for_posix_shell(path)
    )
}

/// `'<mgr>' <args...>`, e.g. `info --json`
pub fn package_manager_command(manager: &str, args: &[&str]) -> String {
    join_posix(std::iter::once(manager).chain(args.iter().copied()))
}

/// `'<mgr>' env create [-n '<name>'] -f '<yaml>'`
pub fn create_env_command(manager: &str, yaml_file: &str, env_name: Option<&str>) -> String {
    let mut command = format!("{} env create", escape_for_posix_shell(manager));
    if let Some(name) = env_name.filter(|n| !n.is_empty()) {
        command.push_str(" -n ");
        command.push_str(&escape_for_posix_shell(name));
    }
    command.push_str(" -f ");
    command.push_str(&escape_for_posix_shell(yaml_file));
    command
}

/// `'<mgr>' env remove -n '<name>' -y`
pub fn remove_env_command(manager: &str, env_name: &str) -> String {
    format!(
        "{} env remove -n {} -y",
        escape_for_posix_shell(manager),
        escape_for_posix_shell(env_name)
    )
}

/// `'<python>' '<script>' '<arg>'...`
pub fn run_script_command(interpreter: &str, script: &str, args: &[String]) -> String {
    join_posix(
        [interpreter, script]
            .into_iter()
            .chain(args.iter().map(String::as_str)),
    )
}

/// `'<python>' -c '<code>'`
pub fn run_code_command(interpreter: &str, code: &str) -> String {
    format!(
        "{} -c {}",
        escape_for_posix_shell(interpreter),
        escape_inline_code(code)
    )
}

/// `'<python>' '<script>' --port N '<arg>'...`
pub fn start_service_command(
    interpreter: &str,
    script: &str,
    port: u16,
    service_args: &[String],
) -> String {
    let mut command = format!(
        "{} {} --port {port}",
        escape_for_posix_shell(interpreter),
        escape_for_posix_shell(script)
    );
    for arg in service_args {
        command.push(' ');
        command.push_str(&escape_for_posix_shell(arg));
    }
    command
}
