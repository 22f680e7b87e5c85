fn main() -> ! {
    opthub_sandbox::run_main()
}
