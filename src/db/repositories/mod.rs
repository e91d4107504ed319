mod screenshots;
mod sessions;
mod training_examples;
