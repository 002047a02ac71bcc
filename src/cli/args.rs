use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "delver",
    version,
    about = "staged HTTP content-discovery engine",
    long_about = "Delver expands a payload wordlist into a target URL template, probes the\nresults concurrently, and streams the interesting subset to its sinks.\n\nExamples:\n  delver -u https://target.tld/FUZZ -w wordlists/common.txt\n  delver -u https://target.tld/FUZZ -w common.txt --match-status 200,301 -o hits.jsonl\n  delver -u https://target.tld/FUZZ -w common.txt --progress-file run.json --attempt-log run.attempts\n\nTip: runs sharing a progress file and attempt log resume where they stopped."
)]
pub struct CliArgs {
    #[arg(
        short = 'u',
        long = "url",
        value_name = "URL",
        help_heading = "Input",
        help = "Target URL template; FUZZ, {{FUZZ}} and %s are replaced by each payload."
    )]
    pub url: Option<String>,

    #[arg(
        short = 'w',
        long = "wordlist",
        value_name = "FILE",
        help_heading = "Input",
        help = "Path to the payload wordlist (one line per word)."
    )]
    pub wordlist: Option<String>,

    #[arg(
        short = 'C',
        long = "config",
        value_name = "FILE",
        help_heading = "Input",
        help = "Path to config file (defaults to ~/.delver/config.yml)."
    )]
    pub config: Option<String>,

    #[arg(
        long = "quick",
        help_heading = "Scan",
        help = "Run the quick sample stage first; skip primary when nothing looks interesting."
    )]
    pub quick: bool,

    #[arg(
        long = "quick-wordlist",
        value_name = "FILE",
        help_heading = "Scan",
        help = "Explicit quick-sample wordlist (default: located next to the main wordlist)."
    )]
    pub quick_wordlist: Option<String>,

    #[arg(
        long = "dry-run",
        help_heading = "Scan",
        help = "Display planned permutations without sending any requests."
    )]
    pub dry_run: bool,

    #[arg(
        short = 'c',
        long = "concurrency",
        value_name = "N",
        help_heading = "Performance",
        help = "Number of concurrent workers."
    )]
    pub concurrency: Option<usize>,

    #[arg(
        long = "timeout",
        value_name = "SECONDS",
        help_heading = "Performance",
        help = "Per-request timeout in seconds."
    )]
    pub timeout: Option<u64>,

    #[arg(
        short = 'X',
        long = "method",
        value_name = "METHOD",
        help_heading = "HTTP",
        help = "HTTP method to probe with (GET, HEAD, POST)."
    )]
    pub method: Option<String>,

    #[arg(
        long = "follow-redirects",
        help_heading = "HTTP",
        help = "Follow HTTP redirects (up to 5 hops)."
    )]
    pub follow_redirects: bool,

    #[arg(
        long = "match-status",
        value_name = "CODES",
        help_heading = "Matching",
        help = "Comma-separated status codes to keep (empty keeps everything)."
    )]
    pub match_status: Option<String>,

    #[arg(
        long = "filter-size",
        value_name = "MIN-MAX",
        help_heading = "Matching",
        help = "Keep responses whose size falls in this inclusive range."
    )]
    pub filter_size: Option<String>,

    #[arg(
        long = "similarity-threshold",
        value_name = "T",
        help_heading = "Matching",
        help = "Hide hits whose bodies are this similar to the baseline (0-1)."
    )]
    pub similarity_threshold: Option<f64>,

    #[arg(
        long = "no-baseline",
        help_heading = "Matching",
        help = "Disable the automatic baseline request used for similarity filtering."
    )]
    pub no_baseline: bool,

    #[arg(
        long = "progress-file",
        value_name = "FILE",
        help_heading = "Resume",
        help = "Checkpoint file enabling resumable runs."
    )]
    pub progress_file: Option<String>,

    #[arg(
        long = "attempt-log",
        value_name = "FILE",
        help_heading = "Resume",
        help = "Append-only log deduplicating attempts across restarts."
    )]
    pub attempt_log: Option<String>,

    #[arg(
        long = "run-id",
        value_name = "ID",
        help_heading = "Resume",
        help = "Override the deterministic run identifier."
    )]
    pub run_id: Option<String>,

    #[arg(
        long = "pre-hook",
        value_name = "CMD",
        help_heading = "Hooks",
        help = "Shell command run once before requests; stdout JSON {cookie, headers}."
    )]
    pub pre_hook: Option<String>,

    #[arg(
        long = "verifier",
        value_name = "PATH",
        help_heading = "Hooks",
        help = "Executable invoked per matched result with a JSON event on stdin."
    )]
    pub verifier: Option<String>,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "FILE",
        help_heading = "Output",
        help = "Write all matched results as JSON lines."
    )]
    pub output: Option<String>,

    #[arg(
        long = "show-similarity",
        help_heading = "Output",
        help = "Include similarity scores in output."
    )]
    pub show_similarity: bool,

    #[arg(
        long = "no-color",
        help_heading = "Output",
        help = "Disable colored output."
    )]
    pub no_color: bool,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help_heading = "Output",
        help = "Increase log verbosity (-v, -vv)."
    )]
    pub verbose: u8,
}
