fn main() {
    let code = match bx::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("bx: {:#}", err);
            1
        }
    };
    std::process::exit(code);
}
