mod fixtures;
mod scheduling;
