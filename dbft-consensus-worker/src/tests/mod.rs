mod scenarios;
mod tools;
