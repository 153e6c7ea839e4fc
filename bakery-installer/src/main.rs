fn main() {
    if let Err(err) = bakery_installer::run() {
        eprintln!("{}", bakery_installer::describe_error(&err));
        std::process::exit(1);
    }
}
