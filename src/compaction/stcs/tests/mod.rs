mod tests_major;
