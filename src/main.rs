fn main() {
    keywheel::run();
}
