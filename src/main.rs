fn main() {
    let mut subreddit: Option<String> = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("archfeed {}", archfeed::VERSION);
                return;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            flag if flag.starts_with('-') => {
                eprintln!("Unknown flag: {flag}");
                print_help();
                std::process::exit(2);
            }
            name => {
                if subreddit.is_none() {
                    subreddit = Some(name.to_string());
                }
            }
        }
    }

    let Some(subreddit) = subreddit else {
        eprintln!("A subreddit name is required.\n");
        print_help();
        std::process::exit(2);
    };

    if let Err(err) = archfeed::run(archfeed::app::RunOptions { subreddit }) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!(
        "archfeed — Browse an archived Reddit library from the terminal.\n\n\
Usage: archfeed [OPTIONS] <SUBREDDIT>\n\n\
Options:\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
    );
}
